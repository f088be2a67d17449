// Execution engine: wave-by-wave driver
//
// Validate DAG -> plan waves -> init snapshot -> run each node through the
// step runner -> final (or error) snapshot. Callback ordering is part of
// the contract: steps complete strictly in topological order, context
// updates carry a strictly increasing sequence, retrieval events fire once
// per attempt.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::dag;
use crate::node::NodeRegistry;
use crate::runner::{run_step, Halt, RunIds};
use crate::traits::{EngineServices, ExecutionHooks};
use crate::waves;
use crate::workflow::{
    ContextUpdate, ExecutionResult, ExecutionStatus, SnapshotReason, StepRecord, WorkflowGraph,
};

/// Per-execution knobs supplied by the worker
#[derive(Default)]
pub struct ExecuteOptions {
    /// (max_requests, max_failures, max_duration_ms) retrieval ceilings
    pub retrieval_caps: Option<(u64, u64, u64)>,
    /// (max_loops, max_retries) control ceilings
    pub control_limits: Option<(u32, u32)>,
    /// External cancel signal, honored at step boundaries
    pub cancel: Option<watch::Receiver<bool>>,
}

pub struct ExecutionEngine {
    registry: NodeRegistry,
    services: EngineServices,
}

impl ExecutionEngine {
    pub fn new(registry: NodeRegistry, services: EngineServices) -> Self {
        ExecutionEngine { registry, services }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Drive one execution attempt through the workflow
    pub async fn execute(
        &self,
        workflow: &WorkflowGraph,
        execution_id: Uuid,
        trigger_payload: Value,
        hooks: &dyn ExecutionHooks,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();

        let mut context = ExecutionContext::new();
        if let Some((max_requests, max_failures, max_duration_ms)) = options.retrieval_caps {
            context = context.with_retrieval_caps(max_requests, max_failures, max_duration_ms);
        }
        if let Some((max_loops, max_retries)) = options.control_limits {
            context = context.with_control_limits(max_loops, max_retries);
        }

        // Everything before the first step surfaces as failed with no steps
        let report = dag::validate(&workflow.nodes, &workflow.edges);
        if !report.valid {
            let message = report.errors.join("; ");
            warn!(workflow_id = %workflow.id, error = %message, "DAG validation failed");
            return ExecutionResult {
                status: ExecutionStatus::Failed,
                steps: Vec::new(),
                total_duration_ms: started.elapsed().as_millis() as u64,
                error_message: Some(message),
                context: context.snapshot(),
            };
        }

        if let Some(message) = self.validate_node_configs(workflow) {
            warn!(workflow_id = %workflow.id, error = %message, "node config validation failed");
            return ExecutionResult {
                status: ExecutionStatus::Failed,
                steps: Vec::new(),
                total_duration_ms: started.elapsed().as_millis() as u64,
                error_message: Some(message),
                context: context.snapshot(),
            };
        }

        let plan = waves::plan(&report.execution_order, &workflow.edges);
        context.set_knowledge("scheduler.waves", plan.to_summary());

        info!(
            workflow_id = %workflow.id,
            execution_id = %execution_id,
            nodes = workflow.nodes.len(),
            waves = plan.waves.len(),
            "starting execution"
        );

        self.emit_context(hooks, SnapshotReason::Init, None, &context)
            .await;

        let nodes_by_id: HashMap<&str, &crate::workflow::NodeSpec> = workflow
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n))
            .collect();
        let ids = RunIds {
            execution_id,
            workflow_id: workflow.id,
            user_id: workflow.user_id,
        };

        let mut node_outputs: HashMap<String, Value> = HashMap::new();
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut halt: Option<Halt> = None;
        let mut first_error: Option<String> = None;
        let mut canceled = false;

        for wave in &plan.waves {
            for node_id in wave {
                let node = nodes_by_id[node_id.as_str()];

                // Skip everything once halted
                if let Some(active_halt) = &halt {
                    let reason = match active_halt {
                        Halt::NodeFailed => "Skipped due to previous node failure",
                        Halt::Terminated { reason, .. } => reason.as_str(),
                    };
                    let record = StepRecord::skipped(&node.id, &node.node_type, reason);
                    self.emit_step(hooks, &record).await;
                    steps.push(record);
                    continue;
                }

                // External cancellation lands at the next step boundary
                if let Some(cancel) = &options.cancel {
                    if *cancel.borrow() {
                        debug!(node_id = %node.id, "cancel requested, terminating");
                        context.request_terminate();
                        canceled = true;
                        halt = Some(Halt::Terminated {
                            reason: "Execution canceled".to_string(),
                            violation: false,
                        });
                        let record = StepRecord::skipped(
                            &node.id,
                            &node.node_type,
                            "Execution canceled",
                        );
                        self.emit_step(hooks, &record).await;
                        steps.push(record);
                        continue;
                    }
                }

                let outcome = run_step(
                    node,
                    &workflow.edges,
                    &self.registry,
                    &self.services,
                    ids,
                    &trigger_payload,
                    &node_outputs,
                    &mut context,
                )
                .await;

                for event in &outcome.retrieval_events {
                    if let Err(err) = hooks.on_retrieval_event(event).await {
                        warn!(error = %err, "retrieval event hook failed");
                    }
                }

                self.emit_step(hooks, &outcome.record).await;

                let executed = outcome.record.status != crate::workflow::StepStatus::Skipped;
                if outcome.record.status == crate::workflow::StepStatus::Completed {
                    node_outputs.insert(node.id.clone(), outcome.record.output.clone());
                }
                if outcome.record.status == crate::workflow::StepStatus::Failed {
                    first_error = first_error.or_else(|| outcome.record.error.clone());
                }
                steps.push(outcome.record);

                if executed {
                    self.emit_context(
                        hooks,
                        SnapshotReason::Step,
                        Some(node),
                        &context,
                    )
                    .await;
                }

                if let Some(step_halt) = outcome.halt {
                    if let Halt::Terminated {
                        reason,
                        violation: true,
                    } = &step_halt
                    {
                        context.set_memory(
                            "execution.outcome",
                            json!({
                                "status": "terminated_by_control",
                                "reason": reason,
                                "nodeId": node.id,
                                "at": Utc::now(),
                            }),
                        );
                    }
                    halt = Some(step_halt);
                }
            }
        }

        let (status, error_message) = match &halt {
            Some(Halt::NodeFailed) => (ExecutionStatus::Failed, first_error.clone()),
            Some(Halt::Terminated { reason, violation }) => {
                if canceled {
                    (ExecutionStatus::Canceled, Some(reason.clone()))
                } else if *violation {
                    (
                        ExecutionStatus::Failed,
                        first_error.clone().or_else(|| Some(reason.clone())),
                    )
                } else {
                    // Graceful terminate requested by a control node
                    (ExecutionStatus::Completed, None)
                }
            }
            None => (ExecutionStatus::Completed, None),
        };

        let final_reason = if status == ExecutionStatus::Failed {
            SnapshotReason::Error
        } else {
            SnapshotReason::Final
        };
        self.emit_context(hooks, final_reason, None, &context).await;

        info!(
            execution_id = %execution_id,
            status = status.as_str(),
            steps = steps.len(),
            "execution finished"
        );

        ExecutionResult {
            status,
            steps,
            total_duration_ms: started.elapsed().as_millis() as u64,
            error_message,
            context: context.snapshot(),
        }
    }

    /// Resolve every node type and check its config schema before any step
    fn validate_node_configs(&self, workflow: &WorkflowGraph) -> Option<String> {
        let mut errors: Vec<String> = Vec::new();
        for node in &workflow.nodes {
            match self.registry.resolve(&node.node_type) {
                Ok(handler) => {
                    let outcome = handler.validate(&node.config);
                    if !outcome.valid {
                        errors.push(format!(
                            "Node {} ({}): {}",
                            node.id,
                            node.node_type,
                            outcome.errors.join(", ")
                        ));
                    }
                }
                Err(_) => errors.push(format!(
                    "Node {}: unknown node type {}",
                    node.id, node.node_type
                )),
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }

    async fn emit_step(&self, hooks: &dyn ExecutionHooks, record: &StepRecord) {
        if let Err(err) = hooks.on_step_complete(record).await {
            warn!(node_id = %record.node_id, error = %err, "step hook failed");
        }
    }

    async fn emit_context(
        &self,
        hooks: &dyn ExecutionHooks,
        reason: SnapshotReason,
        node: Option<&crate::workflow::NodeSpec>,
        context: &ExecutionContext,
    ) {
        let update = ContextUpdate {
            reason,
            node_id: node.map(|n| n.id.clone()),
            node_type: node.map(|n| n.node_type.clone()),
            state: context.snapshot(),
            taken_at: Utc::now(),
        };
        if let Err(err) = hooks.on_context_update(&update).await {
            warn!(reason = reason.as_str(), error = %err, "context hook failed");
        }
    }
}
