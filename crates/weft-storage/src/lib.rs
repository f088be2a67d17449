// Weft storage: Postgres persistence and the default knowledge index
//
// The Database facade owns every SQL statement; the worker maps engine
// callbacks onto it. KnowledgeIndex implements the core knowledge port
// with deterministic hash embeddings and cosine scoring.

pub mod encryption;
pub mod knowledge;
pub mod models;
pub mod queue;
pub mod repositories;

pub use encryption::{generate_master_key, EncryptionService};
pub use knowledge::KnowledgeIndex;
pub use queue::ExecutionJob;
pub use repositories::Database;
