//! # Mnesis Core
//!
//! Personal memory engine for LLM clients. Ingests raw conversation
//! transcripts, mines durable user-centric facts, stores them as a versioned
//! semantic graph with decay and conflict detection, and serves them back to
//! MCP / REST front ends.
//!
//! The engine is organized around a single serialized write path:
//! all mutations flow `MemoryCore -> WriteQueue -> Store`, so every write
//! is serializable without per-table locks while readers stay concurrent.
//!
//! Major subsystems:
//!
//! - **Store**: SQLite table store with vector-blob columns and exact
//!   cosine search (`storage`)
//! - **Embedder**: lazy local embeddings, 384-dim unit vectors (`embeddings`)
//! - **Memory lifecycle**: validation, exact + semantic dedup, conflict
//!   detection, versioning, soft delete, Ebbinghaus decay (`memory`)
//! - **Knowledge graph**: typed edges derived on create (`graph`)
//! - **Miner**: transcript -> candidate -> promotion pipeline with a durable
//!   candidate store and persistent job queue (`mining`)
//! - **Scheduler**: periodic decay sweeps and maintenance (`scheduler`)
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use mnesis_core::{Store, EmbeddingService, WriteQueue, MemoryCore, CreateMemoryParams};
//!
//! let store = std::sync::Arc::new(Store::open(None)?);
//! let embedder = std::sync::Arc::new(EmbeddingService::new());
//! let queue = WriteQueue::start(store.clone());
//! let core = MemoryCore::new(store, embedder, queue);
//!
//! let outcome = core
//!     .create_memory(CreateMemoryParams::new(
//!         "The user prefers concise technical answers.",
//!         "preferences",
//!         "semantic",
//!         "claude",
//!     ))
//!     .await?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod embeddings;
pub mod graph;
pub mod memory;
pub mod mining;
pub mod scheduler;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{Config, ConfigHandle, config_dir, data_dir};

pub use embeddings::{
    cosine_similarity, EmbedderStatus, Embedding, EmbeddingError, EmbeddingService,
    EMBEDDING_DIM,
};

pub use storage::{
    ConversationRecord, GraphEdgeRecord, JobRecord, MemoryRecord, MemoryVersionRecord,
    MessageRecord, MiningCandidateRecord, PendingConflictRecord, Result, SessionRecord,
    Store, StoreError,
};

pub use memory::{
    conflicts::is_semantic_contradiction,
    core::{CreateMemoryParams, MemoryCore, SearchHit, WriteOutcome},
    decay::{infer_decay, parse_event_date, DecayDecision},
    sessions::SessionTracker,
    workbench::{ConflictResolution, ConflictWorkbench},
    write_queue::WriteQueue,
    ConflictStatus, DecayProfile, MemoryCategory, MemoryEventKind, MemoryLevel, MemoryStatus,
    Privacy,
};

pub use graph::{graph_search, EdgeType, GraphLayer, GraphNeighbor, GraphSink, Subgraph};

pub use mining::{
    candidates::{CandidateResultUpdate, CandidateStatus, CandidateStore, UpsertStats},
    jobs::{EnqueueOutcome, JobQueue, JobStatus, JobWorker},
    provider::{ProviderKind, ProviderRuntime},
    Miner, MiningOptions, MiningReport, MiningRun, MiningRunStatus,
};

pub use scheduler::{DecaySweepStats, Scheduler, SchedulerState};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model (bge-small-en-v1.5, 384 dimensions)
pub const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-small-en-v1.5";
