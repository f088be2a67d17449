// Node runner: one step's lifecycle
//
// Parent resolution over edge conditions, input assembly, engine-mediated
// retrieval injection, the attempt loop with retry policy and control
// registration, and the skip/halt semantics the engine acts on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{ContextPatch, ExecutionContext};
use crate::error::{sanitize_message, EngineError};
use crate::node::{NodeExecutionContext, NodeInput, NodeInputMetadata, NodeRegistry};
use crate::orchestrator::{orchestrate_for_node, RetrievalEvent, RetrievalSpec};
use crate::retry::{RetryDirective, RetryOutcome, RetryPolicy};
use crate::workflow::{
    AttemptStatus, EdgeSpec, NodeSpec, StepAttempt, StepRecord, StepStatus,
};

/// Reason the engine must stop after this step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// Step failed: remaining nodes skip with
    /// "Skipped due to previous node failure"
    NodeFailed,
    /// control.terminate or a control limit: remaining nodes skip with
    /// this reason. `violation` marks limit crossings as opposed to a
    /// graceful terminate requested by a node.
    Terminated { reason: String, violation: bool },
}

/// Everything one step produced
pub struct StepExecution {
    pub record: StepRecord,
    pub attempts: Vec<StepAttempt>,
    pub retrieval_events: Vec<RetrievalEvent>,
    pub halt: Option<Halt>,
}

impl StepExecution {
    fn skipped(node: &NodeSpec, reason: &str) -> Self {
        StepExecution {
            record: StepRecord::skipped(&node.id, &node.node_type, reason),
            attempts: Vec::new(),
            retrieval_events: Vec::new(),
            halt: None,
        }
    }
}

/// Identity of the surrounding execution
#[derive(Debug, Clone, Copy)]
pub struct RunIds {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
}

/// Run one node end to end against the live context
pub async fn run_step(
    node: &NodeSpec,
    edges: &[EdgeSpec],
    registry: &NodeRegistry,
    services: &crate::traits::EngineServices,
    ids: RunIds,
    trigger_payload: &Value,
    node_outputs: &HashMap<String, Value>,
    context: &mut ExecutionContext,
) -> StepExecution {
    context.set_active_node(Some(&node.id));

    let handler = match registry.resolve(&node.node_type) {
        Ok(handler) => handler,
        Err(err) => {
            context.request_terminate();
            return StepExecution {
                record: StepRecord {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    status: StepStatus::Failed,
                    input: Value::Null,
                    output: Value::Null,
                    duration_ms: 0,
                    error: Some(sanitize_message(&err.to_string())),
                },
                attempts: Vec::new(),
                retrieval_events: Vec::new(),
                halt: Some(Halt::NodeFailed),
            };
        }
    };

    // Parent resolution: edges into this node, in edge-list order
    let parent_edges: Vec<&EdgeSpec> = edges.iter().filter(|e| e.target == node.id).collect();
    let mut matched_outputs: Vec<&Value> = Vec::new();
    for edge in &parent_edges {
        if let Some(output) = node_outputs.get(&edge.source) {
            if edge.parsed_condition().matches(output) {
                matched_outputs.push(output);
            }
        }
    }

    if !parent_edges.is_empty() && matched_outputs.is_empty() {
        debug!(node_id = %node.id, "no parent branch satisfied edge conditions");
        context.set_active_node(None);
        return StepExecution::skipped(node, "No parent branch satisfied edge conditions");
    }

    // input.data = merge(trigger_payload, matched parent outputs);
    // later parents overwrite earlier
    let mut data = trigger_payload.as_object().cloned().unwrap_or_default();
    for output in matched_outputs {
        if let Some(obj) = output.as_object() {
            for (key, value) in obj {
                data.insert(key.clone(), value.clone());
            }
        }
    }

    let schema = handler.config_schema();
    let config = schema.apply_defaults(&node.config);
    let policy = RetryPolicy::from_config(&config);

    let mut ctx = NodeExecutionContext::new(
        ids.execution_id,
        ids.workflow_id,
        ids.user_id,
        &node.id,
        &node.node_type,
        context,
        services,
    );

    // Engine-mediated retrieval opt-in
    if let Some(parsed) = RetrievalSpec::from_node_config(&config) {
        let spec = match parsed {
            Ok(spec) => spec,
            Err(err) => {
                return fail_step(node, &mut ctx, Value::Null, Vec::new(), err);
            }
        };
        let data_value = Value::Object(data.clone());
        match orchestrate_for_node(&mut ctx, &spec, &data_value).await {
            Ok(result) => {
                ctx.set_knowledge(
                    format!("retrieval.{}", node.id),
                    result.compact_summary(),
                );
                data.insert(
                    spec.inject_as.clone(),
                    serde_json::to_value(&result).unwrap_or(Value::Null),
                );
            }
            Err(err) => {
                return fail_step(node, &mut ctx, Value::Null, Vec::new(), err);
            }
        }
    }

    let input = NodeInput {
        data: Value::Object(data),
        metadata: NodeInputMetadata {
            node_config: config,
            execution_id: ids.execution_id,
            workflow_id: ids.workflow_id,
        },
    };

    // Attempt loop
    let mut attempts: Vec<StepAttempt> = Vec::new();
    let mut attempt_no: u32 = 0;

    loop {
        attempt_no += 1;
        let started = Instant::now();
        let result = handler.execute(&input, &mut ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                if let Some(patch_value) = output.pointer("/metadata/contextPatch") {
                    if let Some(patch) = ContextPatch::from_value(patch_value) {
                        ctx.apply_patch(&patch);
                    }
                }

                let directive = RetryDirective::from_output(&output);
                let wants_retry = directive.as_ref().map(|d| d.requested).unwrap_or(false);

                if wants_retry && policy.enabled && policy.retry_on_directive {
                    if attempt_no < policy.max_attempts {
                        let delay_ms = directive
                            .as_ref()
                            .and_then(|d| d.delay_ms)
                            .unwrap_or(policy.delay_ms);
                        attempts.push(StepAttempt {
                            attempt: attempt_no,
                            status: AttemptStatus::Retry,
                            duration_ms,
                            reason: directive.and_then(|d| d.reason),
                        });
                        if let Some(halted) =
                            register_retry_checked(node, &mut ctx, &policy, &input, &mut attempts)
                        {
                            return halted;
                        }
                        sleep_ms(delay_ms).await;
                        continue;
                    }

                    // Directive still raised on the final attempt
                    if policy.fail_on_max_attempts {
                        attempts.push(StepAttempt {
                            attempt: attempt_no,
                            status: AttemptStatus::Failed,
                            duration_ms,
                            reason: Some("Retry attempts exhausted".to_string()),
                        });
                        return fail_step(
                            node,
                            &mut ctx,
                            input.data.clone(),
                            attempts,
                            EngineError::node(format!(
                                "Node {} exhausted {} retry attempts",
                                node.id, policy.max_attempts
                            )),
                        );
                    }
                }

                attempts.push(StepAttempt {
                    attempt: attempt_no,
                    status: AttemptStatus::Completed,
                    duration_ms,
                    reason: None,
                });

                return complete_step(node, &mut ctx, input, output, attempts);
            }
            Err(err) => {
                let message = sanitize_message(&err.to_string());

                if err.is_control_violation() {
                    attempts.push(StepAttempt {
                        attempt: attempt_no,
                        status: AttemptStatus::Failed,
                        duration_ms,
                        reason: Some(message.clone()),
                    });
                    return terminate_step(node, &mut ctx, input.data.clone(), attempts, message);
                }

                attempts.push(StepAttempt {
                    attempt: attempt_no,
                    status: AttemptStatus::Failed,
                    duration_ms,
                    reason: Some(message.clone()),
                });

                if policy.enabled && policy.retry_on_error && attempt_no < policy.max_attempts {
                    if let Some(halted) =
                        register_retry_checked(node, &mut ctx, &policy, &input, &mut attempts)
                    {
                        return halted;
                    }
                    sleep_ms(policy.delay_ms).await;
                    continue;
                }

                warn!(node_id = %node.id, error = %message, "node failed");
                return fail_step(node, &mut ctx, input.data.clone(), attempts, err);
            }
        }
    }
}

async fn sleep_ms(delay_ms: u64) {
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// Register a retry in control and enforce the limits. Returns the halted
/// step when a limit is crossed.
fn register_retry_checked(
    node: &NodeSpec,
    ctx: &mut NodeExecutionContext<'_>,
    policy: &RetryPolicy,
    input: &NodeInput,
    attempts: &mut Vec<StepAttempt>,
) -> Option<StepExecution> {
    ctx.context_mut().register_retry(policy.increment_loop_on_retry);
    match ctx.context_mut().check_control_limits() {
        Ok(()) => None,
        Err(violation) => {
            let message = sanitize_message(&violation.to_string());
            Some(terminate_step(
                node,
                ctx,
                input.data.clone(),
                std::mem::take(attempts),
                message,
            ))
        }
    }
}

/// Finalize a completed step: stamp attempt accounting onto the output and
/// write the retry outcome back into memory.
fn complete_step(
    node: &NodeSpec,
    ctx: &mut NodeExecutionContext<'_>,
    input: NodeInput,
    output: Value,
    attempts: Vec<StepAttempt>,
) -> StepExecution {
    let retries = attempts
        .iter()
        .filter(|a| a.status != AttemptStatus::Completed)
        .count() as u32;
    let outcome = RetryOutcome {
        attempts: attempts.len() as u32,
        retries,
    };

    let mut recorded = output;
    if let Some(obj) = recorded.as_object_mut() {
        obj.insert(
            "_attempts".to_string(),
            serde_json::to_value(&attempts).unwrap_or(Value::Null),
        );
        obj.insert("_attemptCount".to_string(), Value::from(attempts.len()));
        obj.insert("_retryOutcome".to_string(), outcome.to_value());
    }

    ctx.set_memory(format!("retry.outcome.{}", node.id), outcome.to_value());
    ctx.set_memory("retry.lastOutcome", outcome.to_value());

    let total_ms: u64 = attempts.iter().map(|a| a.duration_ms).sum();
    let retrieval_events = ctx.take_retrieval_events();

    ctx.context_mut().mark_node_completed(&node.id);

    let halt = if ctx.control().terminate {
        Some(Halt::Terminated {
            reason: "Execution terminated by control".to_string(),
            violation: false,
        })
    } else if let Err(violation) = ctx.context_mut().check_control_limits() {
        Some(Halt::Terminated {
            reason: sanitize_message(&violation.to_string()),
            violation: true,
        })
    } else {
        None
    };

    StepExecution {
        record: StepRecord {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: StepStatus::Completed,
            input: input.data,
            output: recorded,
            duration_ms: total_ms,
            error: None,
        },
        attempts,
        retrieval_events,
        halt,
    }
}

/// Finalize a failed step: terminate is set so the engine skips the rest
fn fail_step(
    node: &NodeSpec,
    ctx: &mut NodeExecutionContext<'_>,
    input_data: Value,
    attempts: Vec<StepAttempt>,
    err: EngineError,
) -> StepExecution {
    let message = sanitize_message(&err.to_string());
    let total_ms: u64 = attempts.iter().map(|a| a.duration_ms).sum();
    let retrieval_events = ctx.take_retrieval_events();
    ctx.request_terminate();

    StepExecution {
        record: StepRecord {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: StepStatus::Failed,
            input: input_data,
            output: Value::Null,
            duration_ms: total_ms,
            error: Some(message),
        },
        attempts,
        retrieval_events,
        halt: Some(Halt::NodeFailed),
    }
}

/// Finalize a step cut short by a control violation
fn terminate_step(
    node: &NodeSpec,
    ctx: &mut NodeExecutionContext<'_>,
    input_data: Value,
    attempts: Vec<StepAttempt>,
    message: String,
) -> StepExecution {
    let total_ms: u64 = attempts.iter().map(|a| a.duration_ms).sum();
    let retrieval_events = ctx.take_retrieval_events();
    ctx.request_terminate();

    StepExecution {
        record: StepRecord {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: StepStatus::Failed,
            input: input_data,
            output: Value::Null,
            duration_ms: total_ms,
            error: Some(message.clone()),
        },
        attempts,
        retrieval_events,
        halt: Some(Halt::Terminated {
            reason: message,
            violation: true,
        }),
    }
}
