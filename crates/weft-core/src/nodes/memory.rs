// Memory nodes: read and mutate context.memory at a dotted key

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
use crate::template::lookup_path;

pub struct MemoryReadNode;

#[async_trait]
impl NodeHandler for MemoryReadNode {
    fn node_type(&self) -> &'static str {
        "memory-read"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("key", FieldKind::String),
            FieldSpec::with_default("outputKey", FieldKind::String, json!("memoryValue")),
        ])
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let key = input
            .config_str("key")
            .ok_or_else(|| EngineError::node("memory-read needs a key"))?;
        let output_key = input.config_str("outputKey").unwrap_or("memoryValue");

        let value = ctx.get_memory(key).cloned().unwrap_or(Value::Null);

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(output_key.to_string(), value.clone());
        output.insert(
            "_memory".to_string(),
            json!({"key": key, "found": !value.is_null()}),
        );
        Ok(Value::Object(output))
    }
}

const WRITE_OPERATIONS: &[&str] = &["set", "merge", "append", "clear"];

pub struct MemoryWriteNode;

#[async_trait]
impl NodeHandler for MemoryWriteNode {
    fn node_type(&self) -> &'static str {
        "memory-write"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("key", FieldKind::String),
            FieldSpec::with_default("operation", FieldKind::String, json!("set")),
            FieldSpec::optional("value", FieldKind::Any),
            FieldSpec::optional("valuePath", FieldKind::String),
        ])
    }

    fn validate(&self, config: &serde_json::Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(op) = config.get("operation").and_then(Value::as_str) {
            if !WRITE_OPERATIONS.contains(&op) {
                outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                    "Unknown memory operation: {op}"
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
        let key = input
            .config_str("key")
            .ok_or_else(|| EngineError::node("memory-write needs a key"))?;
        let operation = input.config_str("operation").unwrap_or("set");

        // Inline value wins over a path into the input
        let value = input
            .config()
            .get("value")
            .cloned()
            .or_else(|| {
                input
                    .config_str("valuePath")
                    .and_then(|path| lookup_path(&input.data, path).cloned())
            })
            .unwrap_or(Value::Null);

        match operation {
            "set" => ctx.set_memory(key, value.clone()),
            "merge" => {
                let merged = match (ctx.get_memory(key), &value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        let mut out = existing.clone();
                        for (k, v) in incoming {
                            out.insert(k.clone(), v.clone());
                        }
                        Value::Object(out)
                    }
                    _ => value.clone(),
                };
                ctx.set_memory(key, merged);
            }
            "append" => {
                let appended = match ctx.get_memory(key) {
                    Some(Value::Array(existing)) => {
                        let mut out = existing.clone();
                        out.push(value.clone());
                        Value::Array(out)
                    }
                    Some(existing) if !existing.is_null() => {
                        Value::Array(vec![existing.clone(), value.clone()])
                    }
                    _ => Value::Array(vec![value.clone()]),
                };
                ctx.set_memory(key, appended);
            }
            "clear" => ctx.clear_memory(key),
            other => {
                return Err(EngineError::node(format!(
                    "Unknown memory operation: {other}"
                )))
            }
        }

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            "_memory".to_string(),
            json!({"key": key, "operation": operation}),
        );
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

    fn input(config: Value, data: Value) -> NodeInput {
        NodeInput {
            data,
            metadata: NodeInputMetadata {
                node_config: config.as_object().cloned().unwrap_or_default(),
                execution_id: Uuid::now_v7(),
                workflow_id: Uuid::now_v7(),
            },
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "mem",
            "memory-write",
            &mut context,
            &services,
        );

        MemoryWriteNode
            .execute(
                &input(
                    json!({"key": "session.summary", "value": "hello"}),
                    json!({}),
                ),
                &mut ctx,
            )
            .await
            .unwrap();

        let output = MemoryReadNode
            .execute(
                &input(json!({"key": "session.summary"}), json!({})),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(output["memoryValue"], json!("hello"));
        assert_eq!(output["_memory"]["found"], json!(true));
    }

    #[tokio::test]
    async fn merge_and_append_operations() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "mem",
            "memory-write",
            &mut context,
            &services,
        );

        MemoryWriteNode
            .execute(
                &input(json!({"key": "profile", "value": {"a": 1}}), json!({})),
                &mut ctx,
            )
            .await
            .unwrap();
        MemoryWriteNode
            .execute(
                &input(
                    json!({"key": "profile", "operation": "merge", "value": {"b": 2}}),
                    json!({}),
                ),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.get_memory("profile"), Some(&json!({"a": 1, "b": 2})));

        MemoryWriteNode
            .execute(
                &input(
                    json!({"key": "events", "operation": "append", "value": "first"}),
                    json!({}),
                ),
                &mut ctx,
            )
            .await
            .unwrap();
        MemoryWriteNode
            .execute(
                &input(
                    json!({"key": "events", "operation": "append", "value": "second"}),
                    json!({}),
                ),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.get_memory("events"), Some(&json!(["first", "second"])));
    }

    #[tokio::test]
    async fn value_path_reads_from_input() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "mem",
            "memory-write",
            &mut context,
            &services,
        );

        MemoryWriteNode
            .execute(
                &input(
                    json!({"key": "copied", "valuePath": "user.name"}),
                    json!({"user": {"name": "Ada"}}),
                ),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.get_memory("copied"), Some(&json!("Ada")));
    }

    #[tokio::test]
    async fn clear_removes_the_key() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "mem",
            "memory-write",
            &mut context,
            &services,
        );

        ctx.set_memory("temp", json!(1));
        MemoryWriteNode
            .execute(
                &input(json!({"key": "temp", "operation": "clear"}), json!({})),
                &mut ctx,
            )
            .await
            .unwrap();
        assert!(ctx.get_memory("temp").is_none());
    }
}
