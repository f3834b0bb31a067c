pub mod audit;
pub mod embedder;
pub mod memory;
pub mod session;

pub use audit::{authorizing_decision, AuditEvent, AuditLogger, AuditSink, MemoryAuditSink};
pub use embedder::{build_embedder, cosine_similarity, Embedder, HashingEmbedder, OpenAIEmbedder};
pub use memory::{
    build_store, EvictionPolicy, InMemoryBackend, MemoryBackend, MemoryRecord, MemoryStore, Recall,
    ScoredRecord, SqliteBackend, WriteMode,
};
pub use session::SessionStore;
