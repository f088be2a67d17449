// Core traits for pluggable backends
//
// These traits keep the engine storage- and provider-agnostic:
// - ExecutionHooks: persistence callbacks (database in production,
//   collecting vectors in tests)
// - KnowledgeStore: retrieval/ingest port (Postgres index in production,
//   in-memory map in tests)
// - LlmDriver: model calls (openai/anthropic drivers, scripted in tests)
// - ApiKeyResolver: decrypted provider keys for the executing user

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::orchestrator::RetrievalEvent;
use crate::workflow::{ContextUpdate, StepRecord};

// ============================================================================
// ExecutionHooks - engine-to-persistence callbacks
// ============================================================================

/// Callbacks the engine invokes as an execution progresses.
///
/// Invocation ordering is part of the contract:
/// - `on_step_complete` fires strictly in step-completion order
/// - `on_context_update` fires exactly once per init, step, and final/error
/// - `on_retrieval_event` fires once per retriever attempt, including
///   budget-denied attempts
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn on_step_complete(&self, step: &StepRecord) -> Result<()> {
        let _ = step;
        Ok(())
    }

    async fn on_context_update(&self, update: &ContextUpdate) -> Result<()> {
        let _ = update;
        Ok(())
    }

    async fn on_retrieval_event(&self, event: &RetrievalEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }
}

/// Hooks that do nothing; useful for tests and dry runs
pub struct NoopHooks;

#[async_trait]
impl ExecutionHooks for NoopHooks {}

// ============================================================================
// KnowledgeStore - retrieval and ingest port
// ============================================================================

/// Corpus visibility scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    User,
    Workflow,
    Execution,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::User => "user",
            ScopeType::Workflow => "workflow",
            ScopeType::Execution => "execution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Some(ScopeType::User),
            "workflow" => Some(ScopeType::Workflow),
            "execution" => Some(ScopeType::Execution),
            _ => None,
        }
    }
}

/// One retrieval query against the knowledge port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveRequest {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub query: String,
    pub top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<ScopeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id_scope: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id_scope: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retriever_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<usize>,
}

/// One scored chunk match
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeMatch {
    pub chunk_id: Uuid,
    pub corpus_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub score: f64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Raw response from the knowledge port, before orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResponse {
    pub query: String,
    pub top_k: usize,
    pub matches: Vec<KnowledgeMatch>,
}

/// One document ingest into the knowledge port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub title: String,
    pub content_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<ScopeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id_scope: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id_scope: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Outcome of an ingest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub corpus_id: Uuid,
    pub document_id: Uuid,
    pub chunk_count: usize,
    pub status: String,
}

/// The knowledge port the retrieval orchestrator and ingest nodes consume.
/// Implementations decide chunking, embedding, and scoring; the engine
/// treats them as a black box.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn retrieve(&self, request: RetrieveRequest) -> Result<RetrievalResponse>;
    async fn ingest(&self, request: IngestRequest) -> Result<IngestReceipt>;
}

// ============================================================================
// LlmDriver - model call port
// ============================================================================

/// One LLM generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Provider tag ("openai", "anthropic"); routed drivers may fall back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_ms: u64,
}

impl Default for LlmRequest {
    fn default() -> Self {
        LlmRequest {
            prompt: String::new(),
            system_prompt: None,
            provider: None,
            model: None,
            max_tokens: 1024,
            temperature: 0.7,
            timeout_ms: 60_000,
        }
    }
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmUsage {
    pub total_tokens: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One LLM generation result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmGeneration {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: LlmUsage,
    pub duration_ms: u64,
}

/// Trait for LLM providers. Implementations handle provider-specific API
/// calls and response parsing; per-call timeouts bound in-flight work.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> Result<LlmGeneration>;
}

// ============================================================================
// ApiKeyResolver - decrypted provider keys
// ============================================================================

/// Resolve a decrypted API key for a provider on behalf of the executing
/// user. Returns None when the user has no key for that provider.
#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    async fn resolve(&self, provider: &str) -> Result<Option<String>>;
}

// ============================================================================
// EngineServices - bundle handed to node implementations
// ============================================================================

/// External collaborators available to node implementations. Nodes receive
/// this through their execution context handle; absent services fail the
/// nodes that need them, not the engine.
#[derive(Clone)]
pub struct EngineServices {
    pub llm: Option<Arc<dyn LlmDriver>>,
    pub knowledge: Option<Arc<dyn KnowledgeStore>>,
    pub http: reqwest::Client,
}

impl EngineServices {
    pub fn new() -> Self {
        EngineServices {
            llm: None,
            knowledge: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmDriver>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }
}

impl Default for EngineServices {
    fn default() -> Self {
        Self::new()
    }
}
