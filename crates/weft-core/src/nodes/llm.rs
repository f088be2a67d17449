// LLM node
//
// Resolves the prompt (inline or interpolated template), auto-appends
// upstream file uploads and retrieved knowledge, calls the provider through
// the LLM port, and raises a retry directive when the configured quality
// check fails.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
use crate::template::interpolate;
use crate::traits::LlmRequest;

const DEFAULT_MAX_TOKENS: u64 = 1024;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// At most this many knowledge matches are folded into the prompt
const MAX_KNOWLEDGE_SNIPPETS: usize = 5;

pub struct LlmNode;

#[async_trait]
impl NodeHandler for LlmNode {
    fn node_type(&self) -> &'static str {
        "llm"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::optional("prompt", FieldKind::String),
            FieldSpec::optional("promptTemplate", FieldKind::String),
            FieldSpec::optional("systemPrompt", FieldKind::String),
            FieldSpec::optional("provider", FieldKind::String),
            FieldSpec::optional("model", FieldKind::String),
            FieldSpec::with_default("maxTokens", FieldKind::Integer, json!(DEFAULT_MAX_TOKENS)),
            FieldSpec::with_default("temperature", FieldKind::Number, json!(0.7)),
            FieldSpec::with_default("timeoutMs", FieldKind::Integer, json!(DEFAULT_TIMEOUT_MS)),
            FieldSpec::optional("qualityCheckRequiredText", FieldKind::String),
            FieldSpec::optional("qualityCheckMinLength", FieldKind::Integer),
        ])
    }

    fn validate(&self, config: &serde_json::Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        let has_prompt = config.get("prompt").map_or(false, Value::is_string)
            || config.get("promptTemplate").map_or(false, Value::is_string);
        if !has_prompt {
            outcome = outcome.merge(ValidationOutcome::from_errors(vec![
                "llm node needs a prompt or promptTemplate".to_string(),
            ]));
        }
        outcome
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let driver = ctx
            .services()
            .llm
            .clone()
            .ok_or_else(|| EngineError::node("No LLM driver configured"))?;

        let mut prompt = match (input.config_str("prompt"), input.config_str("promptTemplate")) {
            (Some(prompt), _) => prompt.to_string(),
            (None, Some(template)) => interpolate(template, &input.data),
            (None, None) => {
                return Err(EngineError::node("llm node needs a prompt or promptTemplate"))
            }
        };

        if let Some(files) = detect_file_uploads(&input.data) {
            prompt.push_str("\n\nAttached files:\n");
            prompt.push_str(&files);
        }
        if let Some(knowledge) = detect_knowledge(&input.data) {
            prompt.push_str("\n\nRelevant knowledge:\n");
            prompt.push_str(&knowledge);
        }

        let request = LlmRequest {
            prompt,
            system_prompt: input.config_str("systemPrompt").map(str::to_string),
            provider: input.config_str("provider").map(str::to_string),
            model: input.config_str("model").map(str::to_string),
            max_tokens: input.config_u64("maxTokens").unwrap_or(DEFAULT_MAX_TOKENS) as u32,
            temperature: input
                .config()
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(0.7) as f32,
            timeout_ms: input.config_u64("timeoutMs").unwrap_or(DEFAULT_TIMEOUT_MS),
        };

        let generation = driver.generate(request).await?;
        debug!(
            node_id = %ctx.node_id,
            model = %generation.model,
            tokens = generation.usage.total_tokens,
            "llm generation finished"
        );

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert("response".to_string(), json!(generation.content));
        output.insert("model".to_string(), json!(generation.model));
        output.insert("provider".to_string(), json!(generation.provider));
        output.insert(
            "usage".to_string(),
            serde_json::to_value(&generation.usage).unwrap_or(Value::Null),
        );
        output.insert("durationMs".to_string(), json!(generation.duration_ms));

        if let Some(reason) = quality_failure(input, &generation.content) {
            output.insert(
                "metadata".to_string(),
                json!({"retry": {"requested": true, "reason": reason}}),
            );
        }

        Ok(Value::Object(output))
    }
}

/// Quality gate: required substring and minimum length
fn quality_failure(input: &NodeInput, content: &str) -> Option<String> {
    if let Some(required) = input.config_str("qualityCheckRequiredText") {
        if !content.contains(required) {
            return Some(format!("Response missing required text: {required}"));
        }
    }
    if let Some(min_length) = input.config_u64("qualityCheckMinLength") {
        let length = content.chars().count() as u64;
        if length < min_length {
            return Some(format!(
                "Response too short: {length} < {min_length} characters"
            ));
        }
    }
    None
}

/// Upstream file-upload outputs: a `files` array of {fileName, content}
/// entries, or flat fileName/fileContent keys
fn detect_file_uploads(data: &Value) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();

    if let Some(files) = data.get("files").and_then(Value::as_array) {
        for file in files {
            let name = file
                .get("fileName")
                .or_else(|| file.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("file");
            if let Some(content) = file.get("content").and_then(Value::as_str) {
                sections.push(format!("--- {name} ---\n{content}"));
            }
        }
    }

    if let (Some(name), Some(content)) = (
        data.get("fileName").and_then(Value::as_str),
        data.get("fileContent").and_then(Value::as_str),
    ) {
        sections.push(format!("--- {name} ---\n{content}"));
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n"))
    }
}

/// Retrieved knowledge injected by the orchestrator under `_knowledge`
fn detect_knowledge(data: &Value) -> Option<String> {
    let matches = data.pointer("/_knowledge/matches")?.as_array()?;
    if matches.is_empty() {
        return None;
    }
    let lines: Vec<String> = matches
        .iter()
        .take(MAX_KNOWLEDGE_SNIPPETS)
        .filter_map(|m| {
            let content = m.get("content").and_then(Value::as_str)?;
            let title = m.get("title").and_then(Value::as_str).unwrap_or("untitled");
            Some(format!("- [{title}] {content}"))
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
