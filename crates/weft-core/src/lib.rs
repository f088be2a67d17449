// Weft core: workflow execution engine
//
// The engine validates a DAG of typed nodes, plans topological waves, and
// drives each node through its lifecycle (parent resolution, retrieval
// injection, retries, branch-skip semantics) against a versioned execution
// context. Persistence, knowledge, and LLM access stay behind port traits
// so the same engine runs against Postgres in the worker and against
// in-memory fakes in tests.

pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod expr;
pub mod node;
pub mod nodes;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod template;
pub mod traits;
pub mod waves;
pub mod workflow;

pub use context::{ContextPatch, ControlState, ExecutionContext, RetrievalState, RuntimeState};
pub use engine::{ExecuteOptions, ExecutionEngine};
pub use error::{EngineError, Result};
pub use node::{NodeExecutionContext, NodeHandler, NodeInput, NodeRegistry};
pub use nodes::builtin_registry;
pub use orchestrator::{
    OrchestrationSummary, QueryResult, RetrievalEvent, RetrievalEventStatus, RetrievalOrchestrator,
    RetrievalSpec, RetrievalStrategy,
};
pub use retry::{RetryDirective, RetryPolicy};
pub use schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
pub use traits::{
    ApiKeyResolver, EngineServices, ExecutionHooks, IngestReceipt, IngestRequest, KnowledgeMatch,
    KnowledgeStore, LlmDriver, LlmGeneration, LlmRequest, LlmUsage, NoopHooks, RetrievalResponse,
    RetrieveRequest, ScopeType,
};
pub use workflow::{
    AttemptStatus, ContextUpdate, EdgeCondition, EdgeSpec, ExecutionResult, ExecutionStatus,
    NodeSpec, SnapshotReason, StepAttempt, StepRecord, StepStatus, WorkflowGraph,
};
