// Database models (internal, may differ from engine runtime types)

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Workflow models
// ============================================

/// Workflow row from database
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub version: i32,
    pub nodes: sqlx::types::JsonValue,
    pub edges: sqlx::types::JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a workflow
#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub nodes: sqlx::types::JsonValue,
    pub edges: sqlx::types::JsonValue,
}

// ============================================
// Execution models
// ============================================

/// Execution row from database
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub trigger_payload: sqlx::types::JsonValue,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Step row from database
#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: String,
    pub input: Option<sqlx::types::JsonValue>,
    pub output: Option<sqlx::types::JsonValue>,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Step attempt row from database
#[derive(Debug, Clone, FromRow)]
pub struct StepAttemptRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub attempt: i32,
    pub status: String,
    pub duration_ms: i64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Context snapshot row from database
#[derive(Debug, Clone, FromRow)]
pub struct ContextSnapshotRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub sequence: i32,
    pub reason: String,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub state: sqlx::types::JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Retrieval event row from database
#[derive(Debug, Clone, FromRow)]
pub struct RetrievalEventRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub query: String,
    pub top_k: i32,
    pub attempt: i32,
    pub max_attempts: i32,
    pub status: String,
    pub matches_count: i32,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub scope_type: Option<String>,
    pub corpus_id: Option<Uuid>,
    pub workflow_id_scope: Option<Uuid>,
    pub execution_id_scope: Option<Uuid>,
    pub strategy: Option<String>,
    pub retriever_key: Option<String>,
    pub branch_index: Option<i32>,
    pub selected: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Knowledge models
// ============================================

/// Corpus row from database
#[derive(Debug, Clone, FromRow)]
pub struct CorpusRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub scope_type: String,
    pub workflow_id_scope: Option<Uuid>,
    pub execution_id_scope: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Document row from database
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub corpus_id: Uuid,
    pub title: String,
    pub source_type: Option<String>,
    pub metadata: Option<sqlx::types::JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// Chunk row from database, embedding included
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub id: Uuid,
    pub corpus_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Provider key models
// ============================================

/// Provider API key row; the key itself is encrypted at rest
#[derive(Debug, Clone, FromRow)]
pub struct ProviderKeyRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub encrypted_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Job queue models
// ============================================

/// Queue job row
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub payload: sqlx::types::JsonValue,
    pub attempts: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
