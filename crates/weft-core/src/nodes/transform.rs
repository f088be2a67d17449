// Transformer and code nodes: sandboxed transforms over the input
//
// Both run through the restricted expression evaluator; no user-authored
// code is ever evaluated in-process.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::expr;
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};

/// Assignment-based transform: each entry writes one output field
pub struct TransformerNode;

#[async_trait]
impl NodeHandler for TransformerNode {
    fn node_type(&self) -> &'static str {
        "transformer"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("assignments", FieldKind::Array),
            FieldSpec::with_default("keepInput", FieldKind::Boolean, json!(true)),
        ])
    }

    fn validate(&self, config: &serde_json::Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(assignments) = config.get("assignments").and_then(Value::as_array) {
            for (idx, assignment) in assignments.iter().enumerate() {
                let ok = assignment
                    .as_object()
                    .map(|a| {
                        a.get("target").map_or(false, Value::is_string)
                            && a.get("expression").map_or(false, Value::is_string)
                    })
                    .unwrap_or(false);
                if !ok {
                    outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                        "Assignment {idx} needs string target and expression"
                    )]));
                }
            }
        }
        outcome
    }

    async fn execute(
        &self,
        input: &NodeInput,
        _ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let assignments = input
            .config()
            .get("assignments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let keep_input = input.config_bool("keepInput").unwrap_or(true);

        let mut output = if keep_input {
            input.data.as_object().cloned().unwrap_or_default()
        } else {
            serde_json::Map::new()
        };

        for assignment in &assignments {
            let target = assignment
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::node("transformer assignment missing target"))?;
            let expression = assignment
                .get("expression")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::node("transformer assignment missing expression"))?;
            let value = expr::evaluate(expression, &input.data)
                .map_err(|e| EngineError::node(format!("transform of {target} failed: {e}")))?;
            output.insert(target.to_string(), value);
        }

        Ok(Value::Object(output))
    }
}

/// Single-expression transform: the evaluated value becomes the output
pub struct CodeNode;

#[async_trait]
impl NodeHandler for CodeNode {
    fn node_type(&self) -> &'static str {
        "code"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("expression", FieldKind::String),
            FieldSpec::with_default("outputKey", FieldKind::String, json!("result")),
        ])
    }

    async fn execute(
        &self,
        input: &NodeInput,
        _ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let expression = input
            .config_str("expression")
            .ok_or_else(|| EngineError::node("code node needs an expression"))?;
        let output_key = input.config_str("outputKey").unwrap_or("result");

        let value = expr::evaluate(expression, &input.data)
            .map_err(|e| EngineError::node(format!("expression failed: {e}")))?;

        // An object result is the output; anything else lands under outputKey
        match value {
            Value::Object(map) => Ok(Value::Object(map)),
            other => Ok(json!({ output_key: other })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::NodeInputMetadata;
    use crate::traits::EngineServices;
    use uuid::Uuid;

    async fn run_transformer(config: Value, data: Value) -> Result<Value> {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "t",
            "transformer",
            &mut context,
            &services,
        );
        let input = NodeInput {
            data,
            metadata: NodeInputMetadata {
                node_config: config.as_object().cloned().unwrap_or_default(),
                execution_id: Uuid::now_v7(),
                workflow_id: Uuid::now_v7(),
            },
        };
        TransformerNode.execute(&input, &mut ctx).await
    }

    #[tokio::test]
    async fn assignments_extend_the_input() {
        let output = run_transformer(
            json!({"assignments": [{"target": "x", "expression": "2"}]}),
            json!({"x": 1, "y": "kept"}),
        )
        .await
        .unwrap();
        assert_eq!(output["x"], json!(2.0));
        assert_eq!(output["y"], json!("kept"));
    }

    #[tokio::test]
    async fn keep_input_false_yields_only_assignments() {
        let output = run_transformer(
            json!({
                "keepInput": false,
                "assignments": [{"target": "total", "expression": "a + b"}]
            }),
            json!({"a": 2, "b": 3}),
        )
        .await
        .unwrap();
        assert_eq!(output, json!({"total": 5.0}));
    }

    #[tokio::test]
    async fn bad_expression_fails_the_node() {
        let err = run_transformer(
            json!({"assignments": [{"target": "x", "expression": "1 +"}]}),
            json!({}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NodeExecution(_)));
    }

    #[tokio::test]
    async fn code_node_wraps_scalar_results() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "c",
            "code",
            &mut context,
            &services,
        );
        let input = NodeInput {
            data: json!({"n": 20}),
            metadata: NodeInputMetadata {
                node_config: json!({"expression": "n * 2"}).as_object().cloned().unwrap(),
                execution_id: Uuid::now_v7(),
                workflow_id: Uuid::now_v7(),
            },
        };
        let output = CodeNode.execute(&input, &mut ctx).await.unwrap();
        assert_eq!(output, json!({"result": 40.0}));
    }
}
