//! Storage Layer
//!
//! SQLite-backed table store with vector-blob columns. All Mnesis tables
//! (memories, versions, events, conflicts, graph edges, conversations,
//! messages, sessions, analysis jobs/index/candidates) live in one database
//! file with WAL enabled so readers never block the single writer.

pub mod migrations;
mod records;
mod sqlite;

pub use records::{
    AnalysisIndexRecord, ConversationRecord, GraphEdgeRecord, JobRecord, MemoryEventRecord,
    MemoryRecord, MemoryVersionRecord, MessageRecord, MiningCandidateRecord,
    PendingConflictRecord, SessionRecord,
};
pub(crate) use records::preview as records_preview;
pub use sqlite::{Store, DEFAULT_DB_FILE};

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Insert referenced a column the on-disk schema does not have yet.
    /// Callers retry with the legacy base column subset.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Classify a rusqlite error, promoting unknown-column failures to
    /// [`StoreError::SchemaMismatch`].
    pub(crate) fn classify(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if message.contains("has no column named") || message.contains("no such column") {
            StoreError::SchemaMismatch(message)
        } else {
            StoreError::Database(err)
        }
    }
}
