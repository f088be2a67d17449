// Worker configuration from the environment

use anyhow::{Context, Result};
use uuid::Uuid;

/// Default queue poll interval between empty claims
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
/// Default queue delivery attempts before dead-lettering
const DEFAULT_JOB_MAX_ATTEMPTS: i32 = 3;

/// Default aggregate retrieval ceilings per execution
const DEFAULT_MAX_RETRIEVAL_REQUESTS: u64 = 50;
const DEFAULT_MAX_RETRIEVAL_FAILURES: u64 = 10;
const DEFAULT_MAX_RETRIEVAL_DURATION_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub job_max_attempts: i32,
    pub max_retrieval_requests: u64,
    pub max_retrieval_failures: u64,
    pub max_retrieval_duration_ms: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;

        Ok(WorkerConfig {
            database_url,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            poll_interval_ms: env_u64("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            job_max_attempts: env_u64("JOB_MAX_ATTEMPTS", DEFAULT_JOB_MAX_ATTEMPTS as u64) as i32,
            max_retrieval_requests: env_u64(
                "RETRIEVAL_MAX_REQUESTS",
                DEFAULT_MAX_RETRIEVAL_REQUESTS,
            ),
            max_retrieval_failures: env_u64(
                "RETRIEVAL_MAX_FAILURES",
                DEFAULT_MAX_RETRIEVAL_FAILURES,
            ),
            max_retrieval_duration_ms: env_u64(
                "RETRIEVAL_MAX_DURATION_MS",
                DEFAULT_MAX_RETRIEVAL_DURATION_MS,
            ),
        })
    }

    pub fn retrieval_caps(&self) -> (u64, u64, u64) {
        (
            self.max_retrieval_requests,
            self.max_retrieval_failures,
            self.max_retrieval_duration_ms,
        )
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
