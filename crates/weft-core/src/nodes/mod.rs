// Built-in node library
//
// Every node type ships with a stable tag; builtin_registry() performs the
// one-time startup registration the engine resolves against.

mod cleaner;
mod condition;
mod control;
mod evaluation;
mod http;
mod knowledge;
mod llm;
mod memory;
mod output;
mod transform;
mod trigger;
mod validator;

pub use cleaner::DataCleanerNode;
pub use condition::ConditionNode;
pub use control::ExecutionControlNode;
pub use evaluation::EvaluationNode;
pub use http::HttpRequestNode;
pub use knowledge::{KnowledgeIngestNode, KnowledgeRetrieveNode};
pub use llm::LlmNode;
pub use memory::{MemoryReadNode, MemoryWriteNode};
pub use output::{LogNode, OutputNode};
pub use transform::{CodeNode, TransformerNode};
pub use trigger::{ManualTriggerNode, ScheduleTriggerNode, WebhookTriggerNode};
pub use validator::JsonValidatorNode;

use std::sync::Arc;

use crate::error::Result;
use crate::node::NodeRegistry;

/// Registry with every built-in node type
pub fn builtin_registry() -> Result<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ManualTriggerNode))?;
    registry.register(Arc::new(WebhookTriggerNode))?;
    registry.register(Arc::new(ScheduleTriggerNode))?;
    registry.register(Arc::new(LlmNode))?;
    registry.register(Arc::new(HttpRequestNode))?;
    registry.register(Arc::new(TransformerNode))?;
    registry.register(Arc::new(CodeNode))?;
    registry.register(Arc::new(DataCleanerNode))?;
    registry.register(Arc::new(JsonValidatorNode))?;
    registry.register(Arc::new(ConditionNode))?;
    registry.register(Arc::new(MemoryReadNode))?;
    registry.register(Arc::new(MemoryWriteNode))?;
    registry.register(Arc::new(EvaluationNode))?;
    registry.register(Arc::new(ExecutionControlNode))?;
    registry.register(Arc::new(KnowledgeIngestNode))?;
    registry.register(Arc::new(KnowledgeRetrieveNode))?;
    registry.register(Arc::new(OutputNode))?;
    registry.register(Arc::new(LogNode))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_the_node_library() {
        let registry = builtin_registry().unwrap();
        for tag in [
            "manual-trigger",
            "webhook-trigger",
            "schedule-trigger",
            "llm",
            "http-request",
            "transformer",
            "code",
            "data-cleaner",
            "json-validator",
            "condition",
            "memory-read",
            "memory-write",
            "evaluation",
            "execution-control",
            "knowledge-ingest",
            "knowledge-retrieve",
            "output",
            "log",
        ] {
            assert!(registry.contains(tag), "missing node type {tag}");
        }
    }
}
