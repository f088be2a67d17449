// Schema-driven node config validation
//
// Each built-in node declares a ConfigSchema: field name, kind, required,
// default. validate() walks the schema against the opaque config map so the
// closed node set shares one checker instead of per-node reflection.

use serde_json::{Map, Value};

/// Kind of a config field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// Accepts anything; presence is still checked when required
    Any,
}

impl FieldKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

/// One declared config field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            name,
            kind,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            name,
            kind,
            required: false,
            default: None,
        }
    }

    pub fn with_default(name: &'static str, kind: FieldKind, default: Value) -> Self {
        FieldSpec {
            name,
            kind,
            required: false,
            default: Some(default),
        }
    }
}

/// Declared schema for one node type's config
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    pub fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        ConfigSchema { fields }
    }

    /// Check a config map against this schema
    pub fn check(&self, config: &Map<String, Value>) -> ValidationOutcome {
        let mut errors = Vec::new();
        for field in &self.fields {
            match config.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!("Missing required config field: {}", field.name));
                    }
                }
                Some(value) => {
                    if !field.kind.accepts(value) {
                        errors.push(format!(
                            "Config field {} must be a {}",
                            field.name,
                            field.kind.as_str()
                        ));
                    }
                }
            }
        }
        ValidationOutcome::from_errors(errors)
    }

    /// A typed view of the config: declared defaults filled in
    pub fn apply_defaults(&self, config: &Map<String, Value>) -> Map<String, Value> {
        let mut out = config.clone();
        for field in &self.fields {
            if let Some(default) = &field.default {
                out.entry(field.name.to_string())
                    .or_insert_with(|| default.clone());
            }
        }
        out
    }
}

/// Result of validating a node config
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        ValidationOutcome {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        ValidationOutcome {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn merge(mut self, other: ValidationOutcome) -> Self {
        self.errors.extend(other.errors);
        self.valid = self.errors.is_empty();
        self
    }
}
