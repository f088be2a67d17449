// Knowledge index: the default KnowledgeStore implementation
//
// Documents are chunked with overlap, embedded with a deterministic
// hash-bucket embedding, and scored by cosine similarity. The engine treats
// this as a black box behind the knowledge port; swapping in a model-backed
// embedder only touches this module.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::{
    IngestReceipt, IngestRequest, KnowledgeMatch, KnowledgeStore, RetrievalResponse,
    RetrieveRequest, ScopeType,
};

use crate::repositories::Database;

/// Embedding dimensionality
const EMBEDDING_DIM: usize = 128;
/// Chunk size in characters
const CHUNK_SIZE: usize = 800;
/// Overlap between consecutive chunks in characters
const CHUNK_OVERLAP: usize = 100;

#[derive(Clone)]
pub struct KnowledgeIndex {
    db: Database,
}

impl KnowledgeIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KnowledgeStore for KnowledgeIndex {
    async fn retrieve(&self, request: RetrieveRequest) -> Result<RetrievalResponse> {
        let query_embedding = embed(&request.query);

        let candidates = self
            .db
            .list_chunks_for_scope(
                request.user_id,
                request.corpus_id,
                request.scope_type.map(|s| s.as_str()),
                request.workflow_id_scope,
                request.execution_id_scope,
            )
            .await?;

        let mut matches: Vec<KnowledgeMatch> = candidates
            .into_iter()
            .map(|(chunk, title)| {
                let score = cosine(&query_embedding, &chunk.embedding);
                KnowledgeMatch {
                    chunk_id: chunk.id,
                    corpus_id: chunk.corpus_id,
                    document_id: chunk.document_id,
                    chunk_index: chunk.chunk_index,
                    score,
                    content: chunk.content,
                    title: Some(title),
                    source_type: None,
                    metadata: serde_json::Value::Null,
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(request.top_k);

        debug!(
            node_id = %request.node_id,
            query = %request.query,
            matches = matches.len(),
            "knowledge retrieval"
        );

        Ok(RetrievalResponse {
            query: request.query,
            top_k: request.top_k,
            matches,
        })
    }

    async fn ingest(&self, request: IngestRequest) -> Result<IngestReceipt> {
        let corpus_id = match request.corpus_id {
            Some(id) => id,
            // No corpus named: resolve a runtime corpus for the scope. The
            // unique (user, name) constraint makes concurrent auto-creation
            // converge on one row.
            None => {
                let scope = request.scope_type.unwrap_or(ScopeType::Execution);
                let name = match scope {
                    ScopeType::User => format!("runtime:user:{}", request.user_id),
                    ScopeType::Workflow => format!(
                        "runtime:workflow:{}",
                        request.workflow_id_scope.unwrap_or(request.workflow_id)
                    ),
                    ScopeType::Execution => format!(
                        "runtime:execution:{}",
                        request.execution_id_scope.unwrap_or(request.execution_id)
                    ),
                };
                self.db
                    .find_or_create_corpus(
                        request.user_id,
                        &name,
                        scope.as_str(),
                        request.workflow_id_scope.or(Some(request.workflow_id)),
                        request.execution_id_scope.or(Some(request.execution_id)),
                    )
                    .await?
                    .id
            }
        };

        let metadata = if request.metadata.is_null() {
            None
        } else {
            Some(request.metadata.clone())
        };
        let document = self
            .db
            .insert_document(
                corpus_id,
                &request.title,
                request.source_type.as_deref(),
                metadata.as_ref(),
            )
            .await?;

        let chunks = chunk_text(&request.content_text);
        let chunk_count = chunks.len();
        for (index, content) in chunks.iter().enumerate() {
            let embedding = embed(content);
            self.db
                .insert_chunk(corpus_id, document.id, index as i32, content, &embedding)
                .await?;
        }

        debug!(
            node_id = %request.node_id,
            corpus_id = %corpus_id,
            chunks = chunk_count,
            "knowledge ingest"
        );

        Ok(IngestReceipt {
            corpus_id,
            document_id: document.id,
            chunk_count,
            status: "ingested".to_string(),
        })
    }
}

/// Split text into overlapping chunks on character boundaries
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= CHUNK_SIZE {
        return vec![text.to_string()];
    }

    let stride = CHUNK_SIZE - CHUNK_OVERLAP;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + CHUNK_SIZE).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

/// Deterministic hash-bucket embedding: each lowercased token hashes into a
/// bucket, the vector is L2-normalized. Identical text always embeds
/// identically, so retrieval stays reproducible across runs and hosts.
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];

    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes")) as usize
            % EMBEDDING_DIM;
        // Ninth byte decides the sign, spreading tokens across the sphere
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Cosine similarity over equal-length vectors
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let a = embed("the printer is on fire");
        let b = embed("the printer is on fire");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }

    #[test]
    fn embedding_is_normalized() {
        let v = embed("some reasonable sentence about refunds");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated() {
        let query = embed("refund policy for orders");
        let related = embed("orders can request a refund within 30 days of purchase");
        let unrelated = embed("the quick brown fox jumps over the lazy dog");
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn identical_text_has_maximal_similarity() {
        let v = embed("hello world");
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("short document");
        assert_eq!(chunks, vec!["short document"]);
    }

    #[test]
    fn long_text_chunks_with_overlap() {
        let text = "x".repeat(2000);
        let chunks = chunk_text(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= CHUNK_SIZE));
        // Consecutive chunks share the overlap region
        let first: String = chunks[0].chars().skip(CHUNK_SIZE - CHUNK_OVERLAP).collect();
        let second: String = chunks[1].chars().take(CHUNK_OVERLAP).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("").is_empty());
    }

    #[test]
    fn empty_embedding_scores_zero() {
        let zero = vec![0.0f32; EMBEDDING_DIM];
        let v = embed("anything");
        assert_eq!(cosine(&zero, &v), 0.0);
    }
}
