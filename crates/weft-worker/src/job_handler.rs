// Job handler: binds one execution to the persistence and queue ports
//
// Status transitions, workflow loading, engine invocation, and the mapping
// of engine callbacks onto database writes. Missing-table errors degrade
// observability instead of failing the execution; everything else
// re-raises so the queue can retry the job per its own policy.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use weft_core::engine::{ExecuteOptions, ExecutionEngine};
use weft_core::nodes::builtin_registry;
use weft_core::traits::{EngineServices, ExecutionHooks};
use weft_core::workflow::{ContextUpdate, ExecutionStatus, StepRecord, WorkflowGraph};
use weft_core::RetrievalEvent;
use weft_storage::{Database, EncryptionService, ExecutionJob, KnowledgeIndex};

use crate::config::WorkerConfig;
use crate::keys::DbApiKeyResolver;
use crate::llm::RoutedLlmDriver;

/// How often the cancel poller checks the execution row
const CANCEL_POLL_INTERVAL_MS: u64 = 2_000;

pub struct JobHandler {
    db: Database,
    encryption: EncryptionService,
    config: WorkerConfig,
}

impl JobHandler {
    pub fn new(db: Database, encryption: EncryptionService, config: WorkerConfig) -> Self {
        Self {
            db,
            encryption,
            config,
        }
    }

    /// Run one execution attempt end to end
    pub async fn run_job(&self, job: &ExecutionJob) -> Result<()> {
        info!(
            execution_id = %job.execution_id,
            workflow_id = %job.workflow_id,
            "handling execution job"
        );

        self.db
            .update_execution_status(
                job.execution_id,
                ExecutionStatus::Running.as_str(),
                Some(Utc::now()),
                None,
                None,
            )
            .await?;

        let workflow = match self.load_workflow(job).await {
            Ok(workflow) => workflow,
            Err(err) => {
                let message = format!("{err:#}");
                self.db
                    .update_execution_status(
                        job.execution_id,
                        ExecutionStatus::Failed.as_str(),
                        None,
                        Some(Utc::now()),
                        Some(&message),
                    )
                    .await?;
                return Err(err);
            }
        };

        // Ports for this job's user
        let resolver = Arc::new(DbApiKeyResolver::new(
            self.db.clone(),
            self.encryption.clone(),
            job.user_id,
        ));
        let services = EngineServices::new()
            .with_llm(Arc::new(RoutedLlmDriver::new(resolver)))
            .with_knowledge(Arc::new(KnowledgeIndex::new(self.db.clone())));

        let registry = builtin_registry().map_err(anyhow::Error::from)?;
        let engine = ExecutionEngine::new(registry, services);
        let hooks = DbHooks::new(self.db.clone(), job.execution_id);

        // Cancel requests flip the watch channel; the engine honors it at
        // the next step boundary
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let cancel_poller = tokio::spawn(poll_for_cancel(
            self.db.clone(),
            job.execution_id,
            cancel_tx,
        ));

        let result = engine
            .execute(
                &workflow,
                job.execution_id,
                job.trigger_payload.clone(),
                &hooks,
                ExecuteOptions {
                    retrieval_caps: Some(self.config.retrieval_caps()),
                    control_limits: None,
                    cancel: Some(cancel_rx),
                },
            )
            .await;

        cancel_poller.abort();

        self.db
            .update_execution_status(
                job.execution_id,
                result.status.as_str(),
                None,
                Some(Utc::now()),
                result.error_message.as_deref(),
            )
            .await?;

        info!(
            execution_id = %job.execution_id,
            status = result.status.as_str(),
            steps = result.steps.len(),
            duration_ms = result.total_duration_ms,
            "execution job finished"
        );

        if result.status == ExecutionStatus::Failed {
            bail!(
                "Execution {} failed: {}",
                job.execution_id,
                result.error_message.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn load_workflow(&self, job: &ExecutionJob) -> Result<WorkflowGraph> {
        let row = self
            .db
            .get_workflow(job.workflow_id)
            .await?
            .with_context(|| format!("Workflow {} not found", job.workflow_id))?;

        let nodes = serde_json::from_value(row.nodes).context("Malformed workflow nodes")?;
        let edges = serde_json::from_value(row.edges).context("Malformed workflow edges")?;
        Ok(WorkflowGraph {
            id: row.id,
            user_id: row.user_id,
            nodes,
            edges,
        })
    }
}

async fn poll_for_cancel(
    db: Database,
    execution_id: Uuid,
    cancel_tx: tokio::sync::watch::Sender<bool>,
) {
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(CANCEL_POLL_INTERVAL_MS)).await;
        match db.is_execution_canceled(execution_id).await {
            Ok(true) => {
                let _ = cancel_tx.send(true);
                break;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "cancel poll failed");
            }
        }
    }
}

// ============================================================================
// DbHooks - engine callbacks mapped onto database writes
// ============================================================================

struct DbHooks {
    db: Database,
    execution_id: Uuid,
    /// Next snapshot sequence; strictly increasing per execution
    sequence: AtomicI32,
}

impl DbHooks {
    fn new(db: Database, execution_id: Uuid) -> Self {
        Self {
            db,
            execution_id,
            sequence: AtomicI32::new(0),
        }
    }

    /// Missing-table conditions degrade gracefully: log and move on
    fn swallow_missing_relation(result: Result<()>, what: &str) -> weft_core::Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_missing_relation(&err) => {
                warn!(what, error = %err, "table missing, skipping write");
                Ok(())
            }
            Err(err) => Err(weft_core::EngineError::Internal(err)),
        }
    }
}

#[async_trait]
impl ExecutionHooks for DbHooks {
    async fn on_step_complete(&self, step: &StepRecord) -> weft_core::Result<()> {
        let input = if step.input.is_null() {
            None
        } else {
            Some(step.input.clone())
        };
        let output = if step.output.is_null() {
            None
        } else {
            Some(step.output.clone())
        };

        let inserted = self
            .db
            .insert_step(
                self.execution_id,
                &step.node_id,
                &step.node_type,
                step.status.as_str(),
                input.as_ref(),
                output.as_ref(),
                step.duration_ms as i64,
                step.error.as_deref(),
            )
            .await
            .map(|_| ());
        Self::swallow_missing_relation(inserted, "execution_steps")?;

        // Completed outputs carry their attempt trail; persist it row by row
        if let Some(attempts) = step.output.get("_attempts").and_then(Value::as_array) {
            for attempt in attempts {
                let number = attempt.get("attempt").and_then(Value::as_i64).unwrap_or(0) as i32;
                let status = attempt
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("completed");
                let duration_ms = attempt
                    .get("durationMs")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let reason = attempt.get("reason").and_then(Value::as_str);

                let inserted = self
                    .db
                    .insert_step_attempt(
                        self.execution_id,
                        &step.node_id,
                        &step.node_type,
                        number,
                        status,
                        duration_ms,
                        reason,
                    )
                    .await;
                Self::swallow_missing_relation(inserted, "step_attempts")?;
            }
        }

        Ok(())
    }

    async fn on_context_update(&self, update: &ContextUpdate) -> weft_core::Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let inserted = self
            .db
            .insert_context_snapshot(
                self.execution_id,
                sequence,
                update.reason.as_str(),
                update.node_id.as_deref(),
                update.node_type.as_deref(),
                &update.state,
            )
            .await;
        Self::swallow_missing_relation(inserted, "context_snapshots")
    }

    async fn on_retrieval_event(&self, event: &RetrievalEvent) -> weft_core::Result<()> {
        let inserted = self.db.insert_retrieval_event(self.execution_id, event).await;
        Self::swallow_missing_relation(inserted, "retrieval_events")
    }
}

/// SQLSTATE 42P01: undefined_table ("relation ... does not exist")
fn is_missing_relation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .map_or(false, |db_err| {
                db_err.code().as_deref() == Some("42P01")
                    || db_err.message().contains("does not exist")
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_errors_are_not_missing_relation() {
        let err = anyhow::anyhow!("connection refused");
        assert!(!is_missing_relation(&err));
    }
}
