// Error types for workflow execution

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Maximum length of a sanitized error message surfaced to users
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Errors that can occur while validating or executing a workflow
#[derive(Debug, Error)]
pub enum EngineError {
    /// DAG invalid, node config invalid, or bad edge. Fails the execution
    /// before any step runs.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A node type tag has no registration
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// Thrown by a node's execute; retried per policy, then becomes a step
    /// failure that stops execution.
    #[error("Node execution error: {0}")]
    NodeExecution(String),

    /// Aggregate retrieval budget exceeded
    #[error("Retrieval budget exceeded: {0}")]
    RetrievalBudget(String),

    /// No API key available for the requested LLM provider (and no fallback)
    #[error("No API key available for provider: {0}")]
    ProviderKeyMissing(String),

    /// retry_count > max_retries or loop_count > max_loops
    #[error("Execution control violation: {0}")]
    ControlViolation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Create a node execution error
    pub fn node(msg: impl Into<String>) -> Self {
        EngineError::NodeExecution(msg.into())
    }

    /// Create a retrieval budget error
    pub fn budget(msg: impl Into<String>) -> Self {
        EngineError::RetrievalBudget(msg.into())
    }

    /// Create a control violation error
    pub fn control(msg: impl Into<String>) -> Self {
        EngineError::ControlViolation(msg.into())
    }

    /// True when the error must stop the execution regardless of retry policy
    pub fn is_control_violation(&self) -> bool {
        matches!(self, EngineError::ControlViolation(_))
    }
}

/// Sanitize an error message for persistence: single line, truncated.
/// Stack traces and debug formatting never reach the execution row.
pub fn sanitize_message(message: &str) -> String {
    let flat = message
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if flat.len() > MAX_ERROR_MESSAGE_LEN {
        let mut end = MAX_ERROR_MESSAGE_LEN;
        while !flat.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &flat[..end])
    } else {
        flat
    }
}
