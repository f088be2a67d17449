// Data cleaner node: ordered cleaning operations over the input
//
// Operations run in config order. String operations apply recursively to
// every string in the data tree; remove-duplicates applies to arrays.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};

const OPERATIONS: &[&str] = &[
    "trim",
    "normalize-case",
    "remove-special-chars",
    "remove-duplicates",
    "mask-pii",
    "validate-json",
];

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("valid regex"))
}

fn special_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s.,!?@:/-]").expect("valid regex"))
}

pub struct DataCleanerNode;

#[async_trait]
impl NodeHandler for DataCleanerNode {
    fn node_type(&self) -> &'static str {
        "data-cleaner"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![FieldSpec::required("operations", FieldKind::Array)])
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(ops) = config.get("operations").and_then(Value::as_array) {
            for op in ops {
                let name = operation_name(op);
                match name {
                    Some(name) if OPERATIONS.contains(&name) => {}
                    Some(name) => {
                        outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                            "Unknown cleaning operation: {name}"
                        )]));
                    }
                    None => {
                        outcome = outcome.merge(ValidationOutcome::from_errors(vec![
                            "Cleaning operations must be strings or {type: ...} objects"
                                .to_string(),
                        ]));
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
        let operations = input
            .config()
            .get("operations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut data = input.data.clone();
        let mut applied: Vec<String> = Vec::new();

        for op in &operations {
            let name = operation_name(op)
                .ok_or_else(|| EngineError::node("cleaning operation needs a type"))?;
            match name {
                "trim" => map_strings(&mut data, &|s| s.trim().to_string()),
                "normalize-case" => {
                    let mode = op
                        .as_object()
                        .and_then(|o| o.get("mode"))
                        .and_then(Value::as_str)
                        .unwrap_or("lower");
                    if mode == "upper" {
                        map_strings(&mut data, &|s| s.to_uppercase());
                    } else {
                        map_strings(&mut data, &|s| s.to_lowercase());
                    }
                }
                "remove-special-chars" => {
                    map_strings(&mut data, &|s| {
                        special_chars_re().replace_all(s, "").into_owned()
                    });
                }
                "remove-duplicates" => dedupe_arrays(&mut data),
                "mask-pii" => {
                    map_strings(&mut data, &|s| {
                        let masked = email_re().replace_all(s, "***@***");
                        phone_re().replace_all(&masked, "***").into_owned()
                    });
                }
                "validate-json" => {
                    let field = op
                        .as_object()
                        .and_then(|o| o.get("field"))
                        .and_then(Value::as_str);
                    let strict = op
                        .as_object()
                        .and_then(|o| o.get("strict"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if let Some(field) = field {
                        let valid = data
                            .get(field)
                            .and_then(Value::as_str)
                            .map(|s| serde_json::from_str::<Value>(s).is_ok())
                            .unwrap_or(false);
                        if strict && !valid {
                            return Err(EngineError::node(format!(
                                "Field {field} does not contain valid JSON"
                            )));
                        }
                        if let Some(obj) = data.as_object_mut() {
                            obj.insert(format!("_validJson.{field}"), Value::Bool(valid));
                        }
                    }
                }
                other => {
                    return Err(EngineError::node(format!(
                        "Unknown cleaning operation: {other}"
                    )))
                }
            }
            applied.push(name.to_string());
        }

        let mut output = data.as_object().cloned().unwrap_or_default();
        output.insert("_cleaning".to_string(), json!({"operations": applied}));
        Ok(Value::Object(output))
    }
}

fn operation_name(op: &Value) -> Option<&str> {
    match op {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("type").and_then(Value::as_str),
        _ => None,
    }
}

/// Apply a string transform to every string in the tree, keys excluded
fn map_strings(value: &mut Value, f: &dyn Fn(&str) -> String) {
    match value {
        Value::String(s) => *s = f(s),
        Value::Array(items) => {
            for item in items {
                map_strings(item, f);
            }
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                map_strings(v, f);
            }
        }
        _ => {}
    }
}

/// Dedupe every array in the tree, preserving first-seen order
fn dedupe_arrays(value: &mut Value) {
    match value {
        Value::Array(items) => {
            let mut seen: Vec<Value> = Vec::new();
            items.retain(|item| {
                if seen.contains(item) {
                    false
                } else {
                    seen.push(item.clone());
                    true
                }
            });
            for item in items {
                dedupe_arrays(item);
            }
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                dedupe_arrays(v);
            }
        }
        _ => {}
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
            "clean",
            "data-cleaner",
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
        DataCleanerNode.execute(&input, &mut ctx).await
    }

    #[tokio::test]
    async fn trim_and_case_apply_in_order() {
        let output = run(
            json!({"operations": ["trim", {"type": "normalize-case", "mode": "upper"}]}),
            json!({"name": "  ada  "}),
        )
        .await
        .unwrap();
        assert_eq!(output["name"], json!("ADA"));
        assert_eq!(output["_cleaning"]["operations"], json!(["trim", "normalize-case"]));
    }

    #[tokio::test]
    async fn duplicates_are_removed_preserving_order() {
        let output = run(
            json!({"operations": ["remove-duplicates"]}),
            json!({"tags": ["b", "a", "b", "c", "a"]}),
        )
        .await
        .unwrap();
        assert_eq!(output["tags"], json!(["b", "a", "c"]));
    }

    #[tokio::test]
    async fn pii_is_masked() {
        let output = run(
            json!({"operations": ["mask-pii"]}),
            json!({"note": "mail ada@example.com or call +1 555 123 4567"}),
        )
        .await
        .unwrap();
        let note = output["note"].as_str().unwrap();
        assert!(!note.contains("ada@example.com"));
        assert!(!note.contains("555 123 4567"));
    }

    #[tokio::test]
    async fn strict_json_validation_fails_the_node() {
        let err = run(
            json!({"operations": [{"type": "validate-json", "field": "payload", "strict": true}]}),
            json!({"payload": "{not json"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NodeExecution(_)));
    }

    #[test]
    fn unknown_operation_fails_validation() {
        let outcome = DataCleanerNode.validate(
            json!({"operations": ["defragment"]}).as_object().unwrap(),
        );
        assert!(!outcome.valid);
    }
}
