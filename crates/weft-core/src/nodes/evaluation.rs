// Evaluation node: score a value against configured checks
//
// Writes `_evaluation` for pass/fail edge conditions; with
// requestRetryOnFail a failing evaluation raises a retry directive so the
// runner can re-execute the node per its policy.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
use crate::template::lookup_path;

const CHECK_TYPES: &[&str] = &["contains", "min-length", "max-length", "equals", "not-empty"];

pub struct EvaluationNode;

#[async_trait]
impl NodeHandler for EvaluationNode {
    fn node_type(&self) -> &'static str {
        "evaluation"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("valuePath", FieldKind::String),
            FieldSpec::required("checks", FieldKind::Array),
            FieldSpec::with_default("requestRetryOnFail", FieldKind::Boolean, json!(false)),
        ])
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(checks) = config.get("checks").and_then(Value::as_array) {
            for (idx, check) in checks.iter().enumerate() {
                let name = check
                    .as_object()
                    .and_then(|c| c.get("type"))
                    .and_then(Value::as_str);
                match name {
                    Some(name) if CHECK_TYPES.contains(&name) => {}
                    Some(name) => {
                        outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                            "Unknown evaluation check: {name}"
                        )]));
                    }
                    None => {
                        outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                            "Check {idx} needs a type"
                        )]));
                    }
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
        let value_path = input
            .config_str("valuePath")
            .ok_or_else(|| EngineError::node("evaluation needs a valuePath"))?;
        let checks = input
            .config()
            .get("checks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let request_retry = input.config_bool("requestRetryOnFail").unwrap_or(false);

        let value = lookup_path(&input.data, value_path)
            .cloned()
            .unwrap_or(Value::Null);
        let text = match &value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        let mut results: Vec<Value> = Vec::new();
        let mut passed_checks = 0usize;

        for check in &checks {
            let obj = check.as_object().cloned().unwrap_or_default();
            let check_type = obj.get("type").and_then(Value::as_str).unwrap_or("not-empty");
            let passed = run_check(check_type, &obj, &value, &text)?;
            if passed {
                passed_checks += 1;
            }
            results.push(json!({"type": check_type, "passed": passed}));
        }

        let total_checks = checks.len();
        let passed = passed_checks == total_checks;
        let score = if total_checks == 0 {
            1.0
        } else {
            passed_checks as f64 / total_checks as f64
        };

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            "_evaluation".to_string(),
            json!({
                "passed": passed,
                "score": score,
                "totalChecks": total_checks,
                "passedChecks": passed_checks,
                "checks": results,
                "valuePath": value_path,
            }),
        );

        if !passed && request_retry {
            output.insert(
                "metadata".to_string(),
                json!({
                    "retry": {
                        "requested": true,
                        "reason": format!(
                            "Evaluation failed: {passed_checks}/{total_checks} checks passed"
                        ),
                    }
                }),
            );
        }

        Ok(Value::Object(output))
    }
}

fn run_check(
    check_type: &str,
    config: &Map<String, Value>,
    value: &Value,
    text: &str,
) -> Result<bool> {
    match check_type {
        "not-empty" => Ok(!text.is_empty()),
        "contains" => {
            let needle = config
                .get("value")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::node("contains check needs a value"))?;
            Ok(text.contains(needle))
        }
        "min-length" => {
            let min = config.get("value").and_then(Value::as_u64).unwrap_or(1) as usize;
            Ok(text.chars().count() >= min)
        }
        "max-length" => {
            let max = config
                .get("value")
                .and_then(Value::as_u64)
                .unwrap_or(u64::MAX) as usize;
            Ok(text.chars().count() <= max)
        }
        "equals" => Ok(config.get("value").map_or(false, |expected| expected == value)),
        other => Err(EngineError::node(format!(
            "Unknown evaluation check: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::NodeInputMetadata;
    use crate::retry::RetryDirective;
    use crate::traits::EngineServices;
    use uuid::Uuid;

    async fn run(config: Value, data: Value) -> Value {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "eval",
            "evaluation",
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
        EvaluationNode.execute(&input, &mut ctx).await.unwrap()
    }

    #[tokio::test]
    async fn all_checks_passing_yields_passed() {
        let output = run(
            json!({
                "valuePath": "answer",
                "checks": [
                    {"type": "contains", "value": "refund"},
                    {"type": "min-length", "value": 10}
                ]
            }),
            json!({"answer": "your refund is on the way"}),
        )
        .await;
        assert_eq!(output["_evaluation"]["passed"], json!(true));
        assert_eq!(output["_evaluation"]["score"], json!(1.0));
        assert_eq!(output["_evaluation"]["passedChecks"], json!(2));
    }

    #[tokio::test]
    async fn partial_failure_scores_fractionally() {
        let output = run(
            json!({
                "valuePath": "answer",
                "checks": [
                    {"type": "contains", "value": "refund"},
                    {"type": "min-length", "value": 500}
                ]
            }),
            json!({"answer": "refund granted"}),
        )
        .await;
        assert_eq!(output["_evaluation"]["passed"], json!(false));
        assert_eq!(output["_evaluation"]["score"], json!(0.5));
    }

    #[tokio::test]
    async fn failing_evaluation_can_request_retry() {
        let output = run(
            json!({
                "valuePath": "answer",
                "checks": [{"type": "not-empty"}],
                "requestRetryOnFail": true
            }),
            json!({"answer": ""}),
        )
        .await;
        let directive = RetryDirective::from_output(&output).unwrap();
        assert!(directive.requested);
        assert!(directive.reason.unwrap().contains("0/1"));
    }
}
