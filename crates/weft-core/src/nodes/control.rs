// Execution control node: mutate the context's control subtree

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};

const ACTIONS: &[&str] = &[
    "increment-retry",
    "increment-loop",
    "reset-retry",
    "reset-loop",
    "set-max-retries",
    "set-max-loops",
    "terminate",
    "clear-terminate",
];

pub struct ExecutionControlNode;

#[async_trait]
impl NodeHandler for ExecutionControlNode {
    fn node_type(&self) -> &'static str {
        "execution-control"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("action", FieldKind::String),
            FieldSpec::optional("value", FieldKind::Integer),
            FieldSpec::optional("reason", FieldKind::String),
        ])
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(action) = config.get("action").and_then(Value::as_str) {
            if !ACTIONS.contains(&action) {
                outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                    "Unknown control action: {action}"
                )]));
            }
        }
        outcome
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let action = input
            .config_str("action")
            .ok_or_else(|| EngineError::node("execution-control needs an action"))?;
        let value = input.config_u64("value").map(|v| v as u32);

        match action {
            "increment-retry" => ctx.control_mut().retry_count += 1,
            "increment-loop" => ctx.control_mut().loop_count += 1,
            "reset-retry" => ctx.control_mut().retry_count = 0,
            "reset-loop" => ctx.control_mut().loop_count = 0,
            "set-max-retries" => {
                ctx.control_mut().max_retries = value
                    .ok_or_else(|| EngineError::node("set-max-retries needs a value"))?;
            }
            "set-max-loops" => {
                ctx.control_mut().max_loops =
                    value.ok_or_else(|| EngineError::node("set-max-loops needs a value"))?;
            }
            "terminate" => {
                if let Some(reason) = input.config_str("reason") {
                    ctx.set_memory("control.terminateReason", json!(reason));
                }
                ctx.request_terminate();
                info!(node_id = %ctx.node_id, "terminate requested by control node");
            }
            "clear-terminate" => ctx.control_mut().terminate = false,
            other => {
                return Err(EngineError::node(format!(
                    "Unknown control action: {other}"
                )))
            }
        }

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            "_control".to_string(),
            serde_json::to_value(ctx.control()).unwrap_or(Value::Null),
        );
        output.insert("_controlAction".to_string(), json!(action));
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::NodeInputMetadata;
    use crate::traits::EngineServices;
    use uuid::Uuid;

    async fn run(ctx: &mut NodeExecutionContext<'_>, config: Value) -> Value {
        let input = NodeInput {
            data: json!({}),
            metadata: NodeInputMetadata {
                node_config: config.as_object().cloned().unwrap_or_default(),
                execution_id: Uuid::now_v7(),
                workflow_id: Uuid::now_v7(),
            },
        };
        ExecutionControlNode.execute(&input, ctx).await.unwrap()
    }

    #[tokio::test]
    async fn actions_mutate_control_state() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "ctl",
            "execution-control",
            &mut context,
            &services,
        );

        run(&mut ctx, json!({"action": "increment-loop"})).await;
        run(&mut ctx, json!({"action": "increment-retry"})).await;
        run(&mut ctx, json!({"action": "set-max-loops", "value": 7})).await;
        assert_eq!(ctx.control().loop_count, 1);
        assert_eq!(ctx.control().retry_count, 1);
        assert_eq!(ctx.control().max_loops, 7);

        run(&mut ctx, json!({"action": "reset-loop"})).await;
        assert_eq!(ctx.control().loop_count, 0);
    }

    #[tokio::test]
    async fn terminate_records_reason_in_memory() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "ctl",
            "execution-control",
            &mut context,
            &services,
        );

        run(
            &mut ctx,
            json!({"action": "terminate", "reason": "quota reached"}),
        )
        .await;
        assert!(ctx.control().terminate);
        assert_eq!(
            ctx.get_memory("control.terminateReason"),
            Some(&json!("quota reached"))
        );

        run(&mut ctx, json!({"action": "clear-terminate"})).await;
        assert!(!ctx.control().terminate);
    }

    #[test]
    fn unknown_action_fails_validation() {
        let outcome = ExecutionControlNode
            .validate(json!({"action": "self-destruct"}).as_object().unwrap());
        assert!(!outcome.valid);
    }
}
