//! E2E Test Harness
//!
//! Isolated engine instances per test: temporary database, deterministic
//! hashed embedder, all subsystems wired the way the MCP binary wires them.

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use mnesis_core::{
    ConfigHandle, ConflictWorkbench, ConversationRecord, CreateMemoryParams, EmbeddingService,
    JobQueue, JobWorker, MemoryCore, MessageRecord, Miner, MiningOptions, Scheduler, Store,
    WriteQueue, WriteOutcome,
};

/// A fully wired engine over a temp directory.
pub struct TestHarness {
    pub store: Arc<Store>,
    pub core: Arc<MemoryCore>,
    pub workbench: ConflictWorkbench,
    pub miner: Arc<Miner>,
    pub jobs: JobQueue,
    pub worker: JobWorker,
    pub scheduler: Scheduler,
    /// Kept alive so the database directory survives the test.
    _temp_dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let store =
            Arc::new(Store::open(Some(temp_dir.path().join("mnesis.db"))).expect("open store"));
        let embedder = Arc::new(EmbeddingService::hashed());
        let queue = WriteQueue::start(store.clone());
        let core = Arc::new(MemoryCore::new(store.clone(), embedder.clone(), queue.clone()));
        let workbench = ConflictWorkbench::new(store.clone());
        let config = Arc::new(ConfigHandle::new());
        let miner = Arc::new(Miner::new(
            store.clone(),
            core.clone(),
            embedder,
            config.clone(),
        ));
        let jobs = JobQueue::new(store.clone(), queue.clone());
        let worker = JobWorker::new(jobs.clone(), miner.clone());
        let scheduler = Scheduler::new(queue, config, jobs.clone());

        Self {
            store,
            core,
            workbench,
            miner,
            jobs,
            worker,
            scheduler,
            _temp_dir: temp_dir,
        }
    }

    /// Create an active semantic memory and return its outcome.
    pub async fn write_memory(&self, content: &str, category: &str) -> WriteOutcome {
        let mut params = CreateMemoryParams::new(content, category, "semantic", "claude");
        params.confidence_score = 0.9;
        self.core.create_memory(params).await.expect("create_memory")
    }

    /// Seed a conversation of user messages for the miner.
    pub fn seed_conversation(&self, id: &str, user_lines: &[&str]) {
        let now = Utc::now();
        self.store
            .upsert_conversation(&ConversationRecord {
                id: id.to_string(),
                title: format!("Conversation {id}"),
                source_llm: "claude".to_string(),
                started_at: now,
                ended_at: None,
                message_count: user_lines.len() as i64,
                summary: String::new(),
                status: "archived".to_string(),
                tags: vec![],
                memory_ids: vec![],
                raw_file_hash: format!("hash-{id}"),
                imported_at: now,
            })
            .expect("upsert conversation");
        let messages: Vec<MessageRecord> = user_lines
            .iter()
            .enumerate()
            .map(|(index, line)| MessageRecord {
                id: format!("{id}-m{index}"),
                conversation_id: id.to_string(),
                role: "user".to_string(),
                content: line.to_string(),
                timestamp: now + chrono::Duration::seconds(index as i64),
                embedding: None,
            })
            .collect();
        self.store.insert_messages(&messages).expect("insert messages");
    }

    /// Heuristic-mode mining options (LLM not required).
    pub fn mining_options(dry_run: bool) -> MiningOptions {
        MiningOptions {
            dry_run,
            provider: "heuristic".to_string(),
            require_llm_configured: Some(false),
            ..MiningOptions::default()
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
