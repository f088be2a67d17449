// Repository layer for database operations
//
// Raw sqlx queries against Postgres behind a narrow Database facade. The
// engine never sees this layer directly; the worker maps engine callbacks
// onto these writes.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ============================================
    // Workflows
    // ============================================

    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (id, user_id, name, description, nodes, edges, status, version)
            VALUES ($1, $2, $3, $4, $5, $6, 'draft', 1)
            RETURNING id, user_id, name, description, status, version, nodes, edges, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.nodes)
        .bind(&input.edges)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, name, description, status, version, nodes, edges, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Replace nodes/edges; the version increments monotonically on every
    /// graph change
    pub async fn update_workflow_graph(
        &self,
        id: Uuid,
        nodes: sqlx::types::JsonValue,
        edges: sqlx::types::JsonValue,
    ) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE workflows
            SET nodes = $2, edges = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, name, description, status, version, nodes, edges, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&nodes)
        .bind(&edges)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // ============================================
    // Executions
    // ============================================

    pub async fn create_execution(
        &self,
        workflow_id: Uuid,
        trigger_payload: sqlx::types::JsonValue,
    ) -> Result<ExecutionRow> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO executions (id, workflow_id, status, trigger_payload)
            VALUES ($1, $2, 'pending', $3)
            RETURNING id, workflow_id, status, trigger_payload, started_at, finished_at, error_message, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(&trigger_payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, status, trigger_payload, started_at, finished_at, error_message, created_at
            FROM executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn update_execution_status(
        &self,
        id: Uuid,
        status: &str,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        finished_at: Option<chrono::DateTime<chrono::Utc>>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                started_at = COALESCE($3, started_at),
                finished_at = COALESCE($4, finished_at),
                error_message = COALESCE($5, error_message)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(started_at)
        .bind(finished_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Steps and attempts
    // ============================================

    pub async fn insert_step(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_type: &str,
        status: &str,
        input: Option<&sqlx::types::JsonValue>,
        output: Option<&sqlx::types::JsonValue>,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<StepRow> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            INSERT INTO execution_steps (id, execution_id, node_id, node_type, status, input, output, duration_ms, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, execution_id, node_id, node_type, status, input, output, duration_ms, error, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(node_id)
        .bind(node_type)
        .bind(status)
        .bind(input)
        .bind(output)
        .bind(duration_ms)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn insert_step_attempt(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_type: &str,
        attempt: i32,
        status: &str,
        duration_ms: i64,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_attempts (id, execution_id, node_id, node_type, attempt, status, duration_ms, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(node_id)
        .bind(node_type)
        .bind(attempt)
        .bind(status)
        .bind(duration_ms)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Context snapshots
    // ============================================

    pub async fn insert_context_snapshot(
        &self,
        execution_id: Uuid,
        sequence: i32,
        reason: &str,
        node_id: Option<&str>,
        node_type: Option<&str>,
        state: &sqlx::types::JsonValue,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO context_snapshots (id, execution_id, sequence, reason, node_id, node_type, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(sequence)
        .bind(reason)
        .bind(node_id)
        .bind(node_type)
        .bind(state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Retrieval events
    // ============================================

    pub async fn insert_retrieval_event(
        &self,
        execution_id: Uuid,
        event: &weft_core::RetrievalEvent,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retrieval_events
                (id, execution_id, node_id, node_type, query, top_k, attempt, max_attempts,
                 status, matches_count, duration_ms, error_message, scope_type, corpus_id,
                 workflow_id_scope, execution_id_scope, strategy, retriever_key, branch_index, selected)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(&event.node_id)
        .bind(&event.node_type)
        .bind(&event.query)
        .bind(event.top_k as i32)
        .bind(event.attempt as i32)
        .bind(event.max_attempts as i32)
        .bind(event.status.as_str())
        .bind(event.matches_count as i32)
        .bind(event.duration_ms as i64)
        .bind(&event.error_message)
        .bind(event.scope_type.map(|s| s.as_str()))
        .bind(event.corpus_id)
        .bind(event.workflow_id_scope)
        .bind(event.execution_id_scope)
        .bind(event.strategy.as_str())
        .bind(&event.retriever_key)
        .bind(event.branch_index as i32)
        .bind(event.selected)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Provider keys
    // ============================================

    pub async fn upsert_provider_key(
        &self,
        user_id: Uuid,
        provider: &str,
        encrypted_key: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_keys (id, user_id, provider, encrypted_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, provider)
            DO UPDATE SET encrypted_key = EXCLUDED.encrypted_key, updated_at = NOW()
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id)
        .bind(provider)
        .bind(encrypted_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_provider_key(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<ProviderKeyRow>> {
        let row = sqlx::query_as::<_, ProviderKeyRow>(
            r#"
            SELECT id, user_id, provider, encrypted_key, created_at, updated_at
            FROM provider_keys
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn delete_provider_key(&self, user_id: Uuid, provider: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM provider_keys WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Knowledge corpora, documents, chunks
    // ============================================

    /// Find or create a corpus by (user, name). The unique constraint makes
    /// concurrent creation race to a single row.
    pub async fn find_or_create_corpus(
        &self,
        user_id: Uuid,
        name: &str,
        scope_type: &str,
        workflow_id_scope: Option<Uuid>,
        execution_id_scope: Option<Uuid>,
    ) -> Result<CorpusRow> {
        sqlx::query(
            r#"
            INSERT INTO knowledge_corpora (id, user_id, name, scope_type, workflow_id_scope, execution_id_scope)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, name) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id)
        .bind(name)
        .bind(scope_type)
        .bind(workflow_id_scope)
        .bind(execution_id_scope)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, CorpusRow>(
            r#"
            SELECT id, user_id, name, scope_type, workflow_id_scope, execution_id_scope, created_at
            FROM knowledge_corpora
            WHERE user_id = $1 AND name = $2
            "#,
        )
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_corpus(&self, id: Uuid) -> Result<Option<CorpusRow>> {
        let row = sqlx::query_as::<_, CorpusRow>(
            r#"
            SELECT id, user_id, name, scope_type, workflow_id_scope, execution_id_scope, created_at
            FROM knowledge_corpora
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn insert_document(
        &self,
        corpus_id: Uuid,
        title: &str,
        source_type: Option<&str>,
        metadata: Option<&sqlx::types::JsonValue>,
    ) -> Result<DocumentRow> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            INSERT INTO knowledge_documents (id, corpus_id, title, source_type, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, corpus_id, title, source_type, metadata, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(corpus_id)
        .bind(title)
        .bind(source_type)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn insert_chunk(
        &self,
        corpus_id: Uuid,
        document_id: Uuid,
        chunk_index: i32,
        content: &str,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO knowledge_chunks (id, corpus_id, document_id, chunk_index, content, embedding)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(corpus_id)
        .bind(document_id)
        .bind(chunk_index)
        .bind(content)
        .bind(embedding)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Chunks visible to a retrieval, joined with their document titles.
    /// Filtered by corpus when given, otherwise by scope columns.
    pub async fn list_chunks_for_scope(
        &self,
        user_id: Uuid,
        corpus_id: Option<Uuid>,
        scope_type: Option<&str>,
        workflow_id_scope: Option<Uuid>,
        execution_id_scope: Option<Uuid>,
    ) -> Result<Vec<(ChunkRow, String)>> {
        let rows = sqlx::query_as::<_, ChunkWithTitleRow>(
            r#"
            SELECT c.id, c.corpus_id, c.document_id, c.chunk_index, c.content, c.embedding, c.created_at,
                   d.title
            FROM knowledge_chunks c
            JOIN knowledge_documents d ON d.id = c.document_id
            JOIN knowledge_corpora k ON k.id = c.corpus_id
            WHERE k.user_id = $1
              AND ($2::uuid IS NULL OR c.corpus_id = $2)
              AND ($3::text IS NULL OR k.scope_type = $3)
              AND ($4::uuid IS NULL OR k.workflow_id_scope = $4)
              AND ($5::uuid IS NULL OR k.execution_id_scope = $5)
            ORDER BY c.created_at
            "#,
        )
        .bind(user_id)
        .bind(corpus_id)
        .bind(scope_type)
        .bind(workflow_id_scope)
        .bind(execution_id_scope)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ChunkRow {
                        id: r.id,
                        corpus_id: r.corpus_id,
                        document_id: r.document_id,
                        chunk_index: r.chunk_index,
                        content: r.content,
                        embedding: r.embedding,
                        created_at: r.created_at,
                    },
                    r.title,
                )
            })
            .collect())
    }
}

/// Join row for chunk queries
#[derive(sqlx::FromRow)]
struct ChunkWithTitleRow {
    id: Uuid,
    corpus_id: Uuid,
    document_id: Uuid,
    chunk_index: i32,
    content: String,
    embedding: Vec<f32>,
    created_at: chrono::DateTime<chrono::Utc>,
    title: String,
}
