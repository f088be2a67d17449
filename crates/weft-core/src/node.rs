// Node protocol: the validate/execute contract and the execution handle
//
// A node sees its resolved input and a context handle. The handle is the
// only route to shared state: nodes read and patch the execution context
// through it, never owning the context itself. Control signals travel back
// on the output value (`metadata.contextPatch`, `metadata.retry`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::{ContextPatch, ControlState, ExecutionContext, RetrievalState};
use crate::error::{EngineError, Result};
use crate::orchestrator::RetrievalEvent;
use crate::schema::{ConfigSchema, ValidationOutcome};
use crate::traits::EngineServices;

/// Input assembled by the runner for one node execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInput {
    /// merge(trigger_payload, matched_parent_outputs), plus any injected
    /// retrieval results
    pub data: Value,
    pub metadata: NodeInputMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInputMetadata {
    pub node_config: Map<String, Value>,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
}

impl NodeInput {
    /// The node's config with its schema defaults applied
    pub fn config(&self) -> &Map<String, Value> {
        &self.metadata.node_config
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.metadata.node_config.get(key).and_then(Value::as_str)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.metadata.node_config.get(key).and_then(Value::as_bool)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.metadata.node_config.get(key).and_then(Value::as_u64)
    }
}

/// Handle through which a node reads and patches shared execution state.
/// Retrieval events raised by node-driven orchestration are buffered here
/// and drained by the runner for hook emission.
pub struct NodeExecutionContext<'a> {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    context: &'a mut ExecutionContext,
    services: &'a EngineServices,
    retrieval_events: Vec<RetrievalEvent>,
}

impl<'a> NodeExecutionContext<'a> {
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        node_type: &str,
        context: &'a mut ExecutionContext,
        services: &'a EngineServices,
    ) -> Self {
        NodeExecutionContext {
            execution_id,
            workflow_id,
            user_id,
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            context,
            services,
            retrieval_events: Vec::new(),
        }
    }

    pub fn services(&self) -> &EngineServices {
        self.services
    }

    pub fn get_memory(&self, key: &str) -> Option<&Value> {
        self.context.get_memory(key)
    }

    pub fn set_memory(&mut self, key: impl Into<String>, value: Value) {
        self.context.set_memory(key, value);
    }

    pub fn clear_memory(&mut self, key: &str) {
        self.context.clear_memory(key);
    }

    pub fn set_knowledge(&mut self, key: impl Into<String>, value: Value) {
        self.context.set_knowledge(key, value);
    }

    pub fn apply_patch(&mut self, patch: &ContextPatch) {
        self.context.apply_patch(patch);
    }

    pub fn control(&self) -> &ControlState {
        &self.context.control
    }

    pub fn retrieval_state(&self) -> &RetrievalState {
        &self.context.retrieval
    }

    pub fn memory_tree(&self) -> &std::collections::BTreeMap<String, Value> {
        &self.context.memory
    }

    /// Direct control mutation for the execution-control node
    pub fn control_mut(&mut self) -> &mut ControlState {
        &mut self.context.control
    }

    pub fn request_terminate(&mut self) {
        self.context.request_terminate();
    }

    /// Engine-internal: the live context, for the orchestrator bridge
    pub(crate) fn context_mut(&mut self) -> &mut ExecutionContext {
        self.context
    }

    pub(crate) fn push_retrieval_events(&mut self, events: Vec<RetrievalEvent>) {
        self.retrieval_events.extend(events);
    }

    /// Drained by the runner after the attempt completes
    pub fn take_retrieval_events(&mut self) -> Vec<RetrievalEvent> {
        std::mem::take(&mut self.retrieval_events)
    }
}

/// The validate/execute contract every node type implements
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Stable type tag this handler registers under
    fn node_type(&self) -> &'static str;

    /// Declared config schema; empty by default
    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default()
    }

    /// Schema-driven by default; nodes add bespoke checks on top
    fn validate(&self, config: &Map<String, Value>) -> ValidationOutcome {
        self.config_schema().check(config)
    }

    /// Run the node. The returned value is the step output; metadata keys
    /// on it (`metadata.contextPatch`, `metadata.retry`) are interpreted by
    /// the runner.
    async fn execute(&self, input: &NodeInput, ctx: &mut NodeExecutionContext<'_>)
        -> Result<Value>;
}

/// Process-wide mapping from node-type tag to implementation
#[derive(Default, Clone)]
pub struct NodeRegistry {
    handlers: HashMap<&'static str, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler; duplicate tags are rejected
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> Result<()> {
        let tag = handler.node_type();
        if self.handlers.contains_key(tag) {
            return Err(EngineError::validation(format!(
                "Node type already registered: {tag}"
            )));
        }
        self.handlers.insert(tag, handler);
        Ok(())
    }

    /// Resolve a handler by tag
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeHandler>> {
        self.handlers
            .get(node_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoNode;

    #[async_trait]
    impl NodeHandler for EchoNode {
        fn node_type(&self) -> &'static str {
            "echo"
        }

        async fn execute(
            &self,
            input: &NodeInput,
            _ctx: &mut NodeExecutionContext<'_>,
        ) -> Result<Value> {
            Ok(input.data.clone())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(EchoNode)).unwrap();
        let err = registry.register(Arc::new(EchoNode)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn resolve_returns_same_definition_across_calls() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(EchoNode)).unwrap();
        let first = registry.resolve("echo").unwrap();
        let second = registry.resolve("echo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_type_fails_resolution() {
        let registry = NodeRegistry::new();
        let err = match registry.resolve("nope") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert!(matches!(err, EngineError::UnknownNodeType(_)));
    }

    #[tokio::test]
    async fn context_handle_buffers_and_drains_events() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "n1",
            "echo",
            &mut context,
            &services,
        );
        ctx.set_memory("k", json!(1));
        assert_eq!(ctx.get_memory("k"), Some(&json!(1)));
        assert!(ctx.take_retrieval_events().is_empty());
    }
}
