//! MCP Tool Handlers
//!
//! Each module exposes JSON schemas plus `execute_*` handlers. Handlers
//! return `Result<Value, String>`; the server wraps errors into MCP tool
//! error content.

pub mod analysis;
pub mod conflicts;
pub mod conversations;
pub mod feedback;
pub mod graph;
pub mod memory;
pub mod search;
pub mod snapshot;

use std::sync::Arc;

use mnesis_core::{ConflictWorkbench, JobQueue, MemoryCore, Miner};

/// Shared state handed to every tool handler.
pub struct ToolContext {
    pub core: Arc<MemoryCore>,
    pub workbench: Arc<ConflictWorkbench>,
    pub miner: Arc<Miner>,
    pub jobs: JobQueue,
    /// Session opened at MCP initialize; accounts this client's reads,
    /// writes, and feedback.
    pub session_id: String,
}
