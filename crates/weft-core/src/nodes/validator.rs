// JSON validator node: required fields and optional field types

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec};
use crate::template::lookup_path;

pub struct JsonValidatorNode;

#[async_trait]
impl NodeHandler for JsonValidatorNode {
    fn node_type(&self) -> &'static str {
        "json-validator"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::optional("requiredFields", FieldKind::Array),
            FieldSpec::optional("fieldTypes", FieldKind::Object),
            FieldSpec::with_default("strict", FieldKind::Boolean, json!(false)),
        ])
    }

    async fn execute(
        &self,
        input: &NodeInput,
        _ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let required: Vec<String> = input
            .config()
            .get("requiredFields")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let field_types = input
            .config()
            .get("fieldTypes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let strict = input.config_bool("strict").unwrap_or(false);

        let mut violations: Vec<String> = Vec::new();

        for field in &required {
            let present = lookup_path(&input.data, field).map_or(false, |v| !v.is_null());
            if !present {
                violations.push(format!("Missing required field: {field}"));
            }
        }

        for (field, expected) in &field_types {
            let Some(expected) = expected.as_str() else {
                continue;
            };
            if let Some(actual) = lookup_path(&input.data, field) {
                if !type_matches(actual, expected) {
                    violations.push(format!(
                        "Field {field} should be {expected}, got {}",
                        type_name(actual)
                    ));
                }
            }
        }

        if strict && !violations.is_empty() {
            return Err(EngineError::node(format!(
                "JSON validation failed: {}",
                violations.join("; ")
            )));
        }

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            "_validation".to_string(),
            json!({
                "valid": violations.is_empty(),
                "violations": violations,
            }),
        );
        Ok(Value::Object(output))
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::NodeInputMetadata;
    use crate::traits::EngineServices;
    use uuid::Uuid;

    async fn run(config: Value, data: Value) -> Result<Value> {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "v",
            "json-validator",
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
        JsonValidatorNode.execute(&input, &mut ctx).await
    }

    #[tokio::test]
    async fn valid_payload_passes() {
        let output = run(
            json!({"requiredFields": ["user.name"], "fieldTypes": {"user.age": "number"}}),
            json!({"user": {"name": "Ada", "age": 36}}),
        )
        .await
        .unwrap();
        assert_eq!(output["_validation"]["valid"], json!(true));
    }

    #[tokio::test]
    async fn violations_are_collected_when_lenient() {
        let output = run(
            json!({"requiredFields": ["missing"], "fieldTypes": {"age": "number"}}),
            json!({"age": "not a number"}),
        )
        .await
        .unwrap();
        assert_eq!(output["_validation"]["valid"], json!(false));
        assert_eq!(output["_validation"]["violations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn strict_mode_fails_on_violation() {
        let err = run(
            json!({"requiredFields": ["missing"], "strict": true}),
            json!({}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NodeExecution(_)));
    }
}
