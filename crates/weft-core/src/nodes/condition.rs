// Condition node: evaluate (field, operator, value) and record the branch
//
// Writes `_condition.result` for boolean edge conditions and optionally
// `_route` (routeOnTrue / routeOnFalse) for route-valued edges.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
use crate::template::lookup_path;

const OPERATORS: &[&str] = &[
    "equals",
    "not-equals",
    "contains",
    "not-contains",
    "greater-than",
    "less-than",
    "exists",
    "not-exists",
];

pub struct ConditionNode;

#[async_trait]
impl NodeHandler for ConditionNode {
    fn node_type(&self) -> &'static str {
        "condition"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("field", FieldKind::String),
            FieldSpec::with_default("operator", FieldKind::String, json!("equals")),
            FieldSpec::optional("value", FieldKind::Any),
            FieldSpec::optional("routeOnTrue", FieldKind::String),
            FieldSpec::optional("routeOnFalse", FieldKind::String),
        ])
    }

    fn validate(&self, config: &serde_json::Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(op) = config.get("operator").and_then(Value::as_str) {
            if !OPERATORS.contains(&op) {
                outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                    "Unknown condition operator: {op}"
                )]));
            }
        }
        outcome
    }

    async fn execute(
        &self,
        input: &NodeInput,
        _ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let field = input
            .config_str("field")
            .ok_or_else(|| EngineError::node("condition node needs a field"))?;
        let operator = input.config_str("operator").unwrap_or("equals");
        let expected = input.config().get("value").cloned().unwrap_or(Value::Null);

        let actual = lookup_path(&input.data, field);
        let result = evaluate(operator, actual, &expected)?;

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            "_condition".to_string(),
            json!({
                "result": result,
                "field": field,
                "operator": operator,
            }),
        );

        let route = if result {
            input.config_str("routeOnTrue")
        } else {
            input.config_str("routeOnFalse")
        };
        if let Some(route) = route {
            output.insert("_route".to_string(), Value::String(route.to_string()));
        }

        Ok(Value::Object(output))
    }
}

fn evaluate(operator: &str, actual: Option<&Value>, expected: &Value) -> Result<bool> {
    match operator {
        "exists" => Ok(actual.map_or(false, |v| !v.is_null())),
        "not-exists" => Ok(actual.map_or(true, Value::is_null)),
        "equals" => Ok(actual.map_or(false, |v| loose_eq(v, expected))),
        "not-equals" => Ok(actual.map_or(true, |v| !loose_eq(v, expected))),
        "contains" => Ok(contains(actual, expected)),
        "not-contains" => Ok(!contains(actual, expected)),
        "greater-than" => compare(actual, expected).map(|ord| ord == std::cmp::Ordering::Greater),
        "less-than" => compare(actual, expected).map(|ord| ord == std::cmp::Ordering::Less),
        other => Err(EngineError::node(format!(
            "Unknown condition operator: {other}"
        ))),
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    // "42" == 42 and "true" == true keep editor-authored configs forgiving
    match (actual, expected) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
            s.parse::<bool>().map(|p| p == *b).unwrap_or(false)
        }
        _ => false,
    }
}

fn contains(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(Value::String(s)) => match expected {
            Value::String(needle) => s.contains(needle),
            other => s.contains(&other.to_string()),
        },
        Some(Value::Array(items)) => items.contains(expected),
        _ => false,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Result<std::cmp::Ordering> {
    let lhs = actual
        .and_then(numeric)
        .ok_or_else(|| EngineError::node("condition field is not numeric"))?;
    let rhs = numeric(expected)
        .ok_or_else(|| EngineError::node("condition value is not numeric"))?;
    lhs.partial_cmp(&rhs)
        .ok_or_else(|| EngineError::node("condition comparison is undefined"))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
