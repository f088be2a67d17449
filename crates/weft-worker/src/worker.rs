// Worker loop
//
// Claims jobs from the queue one at a time (one execution per worker
// slot), hands each to the job handler, and acknowledges the outcome.
// Shutdown is a watch-channel flip; the in-flight job finishes first.

use std::time::Duration;

use anyhow::Result;
use serde_json::from_value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use weft_storage::{Database, EncryptionService, ExecutionJob};

use crate::config::WorkerConfig;
use crate::job_handler::JobHandler;

pub struct Worker {
    db: Database,
    handler: JobHandler,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(db: Database, encryption: EncryptionService, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = JobHandler::new(db.clone(), encryption, config.clone());
        Self {
            db,
            handler,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signal the worker to stop after the current job
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Poll-and-process until shutdown
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "worker started");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let claimed = match self.db.claim_job(&self.config.worker_id).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(error = %err, "queue claim failed");
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => continue,
                    }
                }
            };

            match claimed {
                Some(job_row) => {
                    let job: ExecutionJob = match from_value(job_row.payload.clone()) {
                        Ok(job) => job,
                        Err(err) => {
                            error!(job_id = %job_row.id, error = %err, "malformed job payload");
                            self.db.fail_job(job_row.id).await.ok();
                            continue;
                        }
                    };

                    match self.handler.run_job(&job).await {
                        Ok(()) => {
                            self.db.complete_job(job_row.id).await.ok();
                        }
                        Err(err) => {
                            warn!(
                                job_id = %job_row.id,
                                execution_id = %job.execution_id,
                                error = %err,
                                "job failed, returning to queue"
                            );
                            self.db.fail_job(job_row.id).await.ok();
                        }
                    }
                }
                None => {
                    // Queue empty: idle until the next poll or shutdown
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }
}
