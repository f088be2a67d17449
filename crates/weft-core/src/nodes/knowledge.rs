// Knowledge nodes: ingest into and retrieve from the knowledge port

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::orchestrator::{orchestrate_for_node, RetrievalSpec};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
use crate::template::{interpolate, lookup_path};
use crate::traits::{IngestRequest, ScopeType};

pub struct KnowledgeIngestNode;

#[async_trait]
impl NodeHandler for KnowledgeIngestNode {
    fn node_type(&self) -> &'static str {
        "knowledge-ingest"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::with_default("title", FieldKind::String, json!("Untitled")),
            FieldSpec::optional("contentText", FieldKind::String),
            FieldSpec::optional("contentPath", FieldKind::String),
            FieldSpec::optional("sourceType", FieldKind::String),
            FieldSpec::optional("corpusId", FieldKind::String),
            FieldSpec::optional("scopeType", FieldKind::String),
            FieldSpec::optional("workflowIdScope", FieldKind::String),
            FieldSpec::optional("executionIdScope", FieldKind::String),
            FieldSpec::optional("metadata", FieldKind::Object),
        ])
    }

    fn validate(&self, config: &serde_json::Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        let has_content = config.get("contentText").map_or(false, Value::is_string)
            || config.get("contentPath").map_or(false, Value::is_string);
        if !has_content {
            outcome = outcome.merge(ValidationOutcome::from_errors(vec![
                "knowledge-ingest needs contentText or contentPath".to_string(),
            ]));
        }
        outcome
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let store = ctx
            .services()
            .knowledge
            .clone()
            .ok_or_else(|| EngineError::node("No knowledge store configured"))?;

        // Inline template first, then a path into the input
        let content_text = match input.config_str("contentText") {
            Some(template) => interpolate(template, &input.data),
            None => {
                let path = input
                    .config_str("contentPath")
                    .ok_or_else(|| EngineError::node("knowledge-ingest needs content"))?;
                match lookup_path(&input.data, path) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => {
                        return Err(EngineError::node(format!(
                            "knowledge-ingest found nothing at {path}"
                        )))
                    }
                }
            }
        };

        if content_text.trim().is_empty() {
            return Err(EngineError::node("knowledge-ingest content is empty"));
        }

        let receipt = store
            .ingest(IngestRequest {
                execution_id: ctx.execution_id,
                workflow_id: ctx.workflow_id,
                user_id: ctx.user_id,
                node_id: ctx.node_id.clone(),
                node_type: ctx.node_type.clone(),
                title: interpolate(
                    input.config_str("title").unwrap_or("Untitled"),
                    &input.data,
                ),
                content_text,
                source_type: input.config_str("sourceType").map(str::to_string),
                corpus_id: input
                    .config_str("corpusId")
                    .and_then(|s| Uuid::parse_str(s).ok()),
                scope_type: input.config_str("scopeType").and_then(ScopeType::parse),
                workflow_id_scope: input
                    .config_str("workflowIdScope")
                    .and_then(|s| Uuid::parse_str(s).ok()),
                execution_id_scope: input
                    .config_str("executionIdScope")
                    .and_then(|s| Uuid::parse_str(s).ok()),
                metadata: input
                    .config()
                    .get("metadata")
                    .cloned()
                    .unwrap_or(Value::Null),
            })
            .await?;

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            "_ingest".to_string(),
            serde_json::to_value(&receipt).unwrap_or(Value::Null),
        );
        Ok(Value::Object(output))
    }
}

pub struct KnowledgeRetrieveNode;

#[async_trait]
impl NodeHandler for KnowledgeRetrieveNode {
    fn node_type(&self) -> &'static str {
        "knowledge-retrieve"
    }

    fn validate(&self, config: &serde_json::Map<String, Value>) -> ValidationOutcome {
        match RetrievalSpec::parse(config) {
            Ok(_) => ValidationOutcome::ok(),
            Err(err) => ValidationOutcome::from_errors(vec![err.to_string()]),
        }
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let spec = RetrievalSpec::parse(input.config())?;
        let result = orchestrate_for_node(ctx, &spec, &input.data).await?;

        ctx.set_knowledge(
            format!("retrieval.{}", ctx.node_id),
            result.compact_summary(),
        );

        let mut output = input.data.as_object().cloned().unwrap_or_default();
        output.insert(
            spec.inject_as.clone(),
            serde_json::to_value(&result).unwrap_or(Value::Null),
        );
        Ok(Value::Object(output))
    }
}
