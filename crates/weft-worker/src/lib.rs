// Weft worker: queue consumer and job handler
//
// One execution per job, one job per worker slot. The handler binds an
// execution to the persistence, knowledge, and LLM ports and maps engine
// callbacks onto database writes.

pub mod config;
pub mod job_handler;
pub mod keys;
pub mod llm;
pub mod worker;

pub use config::WorkerConfig;
pub use job_handler::JobHandler;
pub use keys::DbApiKeyResolver;
pub use llm::RoutedLlmDriver;
pub use worker::Worker;
