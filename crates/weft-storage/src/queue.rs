// Job queue on Postgres
//
// Workers poll with SELECT ... FOR UPDATE SKIP LOCKED so multiple worker
// slots claim jobs without contention. Failed jobs return to pending until
// max_attempts, then dead-letter.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::models::JobRow;
use crate::repositories::Database;

/// Queue-borne job payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_payload: Value,
    pub user_id: Uuid,
}

impl Database {
    /// Enqueue one execution job
    pub async fn enqueue_job(&self, job: &ExecutionJob, max_attempts: i32) -> Result<JobRow> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO job_queue (id, execution_id, workflow_id, user_id, status, payload, attempts, max_attempts)
            VALUES ($1, $2, $3, $4, 'pending', $5, 0, $6)
            RETURNING id, execution_id, workflow_id, user_id, status, payload, attempts, max_attempts,
                      claimed_by, claimed_at, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.execution_id)
        .bind(job.workflow_id)
        .bind(job.user_id)
        .bind(serde_json::to_value(job)?)
        .bind(max_attempts)
        .fetch_one(self.pool())
        .await?;

        debug!(job_id = %row.id, execution_id = %job.execution_id, "enqueued job");
        Ok(row)
    }

    /// Atomically claim the oldest pending job for this worker.
    /// SKIP LOCKED keeps concurrent workers from stepping on each other.
    pub async fn claim_job(&self, worker_id: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH claimable AS (
                SELECT id
                FROM job_queue
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue j
            SET status = 'processing',
                attempts = attempts + 1,
                claimed_by = $1,
                claimed_at = NOW(),
                updated_at = NOW()
            FROM claimable
            WHERE j.id = claimable.id
            RETURNING j.id, j.execution_id, j.workflow_id, j.user_id, j.status, j.payload,
                      j.attempts, j.max_attempts, j.claimed_by, j.claimed_at, j.created_at, j.updated_at
            "#,
        )
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;

        if let Some(job) = &row {
            debug!(job_id = %job.id, worker_id, attempt = job.attempts, "claimed job");
        }
        Ok(row)
    }

    /// Mark a job as completed
    pub async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE job_queue SET status = 'completed', updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Mark a job as failed: back to pending for a retry, or dead-lettered
    /// once attempts reach max_attempts
    pub async fn fail_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = CASE WHEN attempts >= max_attempts THEN 'dead_lettered' ELSE 'pending' END,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Whether a cancel was requested for the job's execution. Surfaced to
    /// the engine as a watch-channel flip at the next step boundary.
    pub async fn is_execution_canceled(&self, execution_id: Uuid) -> Result<bool> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM executions WHERE id = $1")
                .bind(execution_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(matches!(status, Some((s,)) if s == "canceled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_payload_round_trips_with_camel_case() {
        let job = ExecutionJob {
            execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            trigger_payload: json!({"x": 1}),
            user_id: Uuid::now_v7(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("executionId").is_some());
        assert!(value.get("triggerPayload").is_some());
        let parsed: ExecutionJob = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.execution_id, job.execution_id);
    }
}
