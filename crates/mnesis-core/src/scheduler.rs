//! Background Scheduler
//!
//! Periodic sweeps with timestamps persisted to `scheduler_state.json` so
//! schedules survive restarts:
//!
//! - Ebbinghaus decay        every 20 hours
//! - Weekly maintenance      every 7 days (compact + old-session cleanup)
//! - Snapshot token rotation every 90 days
//! - Auto-analysis check     hourly (enqueues a mining job when enabled)
//!
//! Sweeps log and continue on failure; the loop never crashes the process.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigHandle;
use crate::memory::write_queue::WriteQueue;
use crate::memory::{MemoryLevel, MemoryStatus};
use crate::mining::jobs::JobQueue;
use crate::mining::MiningOptions;
use crate::storage::Result;

const DECAY_INTERVAL_HOURS: i64 = 20;
const MAINTENANCE_INTERVAL_DAYS: i64 = 7;
const TOKEN_ROTATION_DAYS: i64 = 90;
const AUTO_ANALYSIS_CHECK_HOURS: i64 = 1;

/// Importance floor for semantic memories during decay.
const SEMANTIC_IMPORTANCE_FLOOR: f64 = 0.1;
/// Working memories below this importance are archived by the sweep.
const WORKING_ARCHIVE_THRESHOLD: f64 = 0.05;
/// Changes smaller than this are skipped.
const MIN_DELTA: f64 = 0.001;

// ============================================================================
// PERSISTED STATE
// ============================================================================

/// Last-run timestamps, one file per data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    pub last_decay: Option<DateTime<Utc>>,
    pub last_maintenance: Option<DateTime<Utc>>,
    pub last_token_rotation: Option<DateTime<Utc>>,
    pub last_auto_analysis: Option<DateTime<Utc>>,
    pub last_decay_stats: Option<DecaySweepStats>,
}

impl SchedulerState {
    fn path() -> PathBuf {
        crate::config::config_dir().join("scheduler_state.json")
    }

    pub fn load() -> Self {
        std::fs::read_to_string(Self::path())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, body)
    }
}

fn elapsed(since: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    match since {
        Some(last) => now - last > interval,
        None => true,
    }
}

/// Result of one decay sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DecaySweepStats {
    pub scanned: usize,
    pub updated: usize,
    pub archived: usize,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Owner of the periodic sweeps.
pub struct Scheduler {
    queue: WriteQueue,
    config: Arc<ConfigHandle>,
    jobs: JobQueue,
}

impl Scheduler {
    pub fn new(queue: WriteQueue, config: Arc<ConfigHandle>, jobs: JobQueue) -> Self {
        Self {
            queue,
            config,
            jobs,
        }
    }

    /// Spawn the scheduler loop (one tick per minute).
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Scheduler started");
            loop {
                if let Err(e) = self.tick().await {
                    tracing::error!("Scheduler loop error: {}", e);
                }
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        })
    }

    /// One pass over all schedules. State is re-read each tick so external
    /// edits are picked up.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let mut state = SchedulerState::load();
        let mut changed = false;

        if elapsed(state.last_decay, Duration::hours(DECAY_INTERVAL_HOURS), now) {
            match self.run_decay_sweep().await {
                Ok(stats) => {
                    tracing::info!(
                        "Decay sweep complete: {}/{} memories updated, {} archived",
                        stats.updated,
                        stats.scanned,
                        stats.archived
                    );
                    state.last_decay_stats = Some(stats);
                }
                Err(e) => tracing::error!("Ebbinghaus decay failed: {}", e),
            }
            state.last_decay = Some(now);
            changed = true;
        }

        if elapsed(
            state.last_maintenance,
            Duration::days(MAINTENANCE_INTERVAL_DAYS),
            now,
        ) {
            if let Err(e) = self.run_weekly_maintenance().await {
                tracing::error!("Weekly maintenance failed: {}", e);
            }
            state.last_maintenance = Some(now);
            changed = true;
        }

        if elapsed(
            state.last_token_rotation,
            Duration::days(TOKEN_ROTATION_DAYS),
            now,
        ) {
            if let Err(e) = self.rotate_snapshot_token() {
                tracing::error!("Token rotation failed: {}", e);
            }
            state.last_token_rotation = Some(now);
            changed = true;
        }

        if elapsed(
            state.last_auto_analysis,
            Duration::hours(AUTO_ANALYSIS_CHECK_HOURS),
            now,
        ) && self.maybe_enqueue_auto_analysis(&state, now).await?
        {
            state.last_auto_analysis = Some(now);
            changed = true;
        }

        if changed {
            if let Err(e) = state.save() {
                tracing::error!("Failed to save scheduler state: {}", e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // DECAY
    // ========================================================================

    /// Apply the Ebbinghaus forgetting curve to every active memory:
    /// `retention = exp(-k * days_since_last_reference)` with per-level `k`.
    /// New importance is `old * retention`, floored at 0.1 for semantic
    /// memories and never raised above the current value. Working memories
    /// that decay below 0.05 are archived.
    ///
    /// The active set is read once at sweep start; rows inserted mid-sweep
    /// are picked up next cycle.
    pub async fn run_decay_sweep(&self) -> Result<DecaySweepStats> {
        let rates = self.config.force_reload().decay_rates;
        self.queue
            .enqueue(move |store| {
                let now = Utc::now();
                let memories = store.memories_with_status(MemoryStatus::Active, 100_000)?;
                let mut stats = DecaySweepStats {
                    scanned: memories.len(),
                    ..DecaySweepStats::default()
                };

                for memory in memories {
                    let k = rates.for_level(memory.level.as_str());
                    let days =
                        ((now - memory.last_referenced_at).num_seconds() as f64 / 86_400.0)
                            .max(0.0);
                    let retention = (-k * days).exp();
                    let floor = if memory.level == MemoryLevel::Semantic {
                        SEMANTIC_IMPORTANCE_FLOOR
                    } else {
                        0.0
                    };
                    // The floor never raises a score that is already below
                    // it: decay is monotonically non-increasing.
                    let new_score = (memory.importance_score * retention)
                        .max(floor)
                        .min(memory.importance_score);

                    if (memory.importance_score - new_score).abs() <= MIN_DELTA {
                        continue;
                    }
                    let rounded = (new_score * 10_000.0).round() / 10_000.0;
                    store.set_memory_importance(&memory.id, rounded)?;
                    stats.updated += 1;

                    if memory.level == MemoryLevel::Working
                        && new_score < WORKING_ARCHIVE_THRESHOLD
                    {
                        store.set_memory_status(&memory.id, MemoryStatus::Archived, now)?;
                        stats.archived += 1;
                    }
                }
                Ok(stats)
            })
            .await
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Compact the store and delete sessions that ended over 30 days ago.
    pub async fn run_weekly_maintenance(&self) -> Result<()> {
        tracing::info!("Running weekly maintenance...");
        self.queue
            .enqueue(|store| {
                if let Err(e) = store.compact() {
                    tracing::warn!("Store compaction failed: {}", e);
                }
                let cutoff = Utc::now() - Duration::days(30);
                let deleted = store.delete_sessions_ended_before(cutoff)?;
                if deleted > 0 {
                    tracing::info!("Deleted {} expired session(s)", deleted);
                }
                Ok(())
            })
            .await
    }

    /// Rotate the snapshot read token and persist the config.
    pub fn rotate_snapshot_token(&self) -> std::io::Result<()> {
        let mut config = self.config.force_reload();
        config.snapshot_token = uuid::Uuid::new_v4().simple().to_string();
        self.config.store(config)?;
        tracing::info!("Snapshot token rotated");
        Ok(())
    }

    // ========================================================================
    // AUTO-ANALYSIS
    // ========================================================================

    /// Enqueue an automatic mining job when auto-analysis is enabled, its
    /// interval has elapsed, and no auto job is already active. Returns
    /// whether the check consumed this slot.
    async fn maybe_enqueue_auto_analysis(
        &self,
        state: &SchedulerState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let analysis = self.config.force_reload().conversation_analysis;
        if !analysis.auto_enabled {
            return Ok(true);
        }
        let interval = Duration::hours(analysis.auto_interval_hours.max(1) as i64);
        if !elapsed(state.last_auto_analysis, interval, now) {
            // Interval not reached; keep the hourly slot open.
            return Ok(false);
        }
        if self
            .jobs
            .has_active_with_trigger(crate::mining::jobs::AUTO_TRIGGER_PREFIX)?
        {
            return Ok(false);
        }

        let payload = MiningOptions {
            dry_run: false,
            provider: "auto".to_string(),
            require_llm_configured: Some(analysis.require_llm_configured),
            ..MiningOptions::default()
        };
        let outcome = self
            .jobs
            .enqueue("auto:interval", payload, 0, 2, None, true)
            .await?;
        tracing::info!("Auto-analysis job {}: {}", outcome.status, outcome.job.id);
        Ok(true)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::Embedding;
    use crate::memory::{DecayProfile, MemoryCategory, Privacy};
    use crate::storage::{MemoryRecord, Store};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        scheduler: Scheduler,
    }

    fn setup() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("sched.db"))).unwrap());
        let queue = WriteQueue::start(store.clone());
        let config = Arc::new(ConfigHandle::new());
        let jobs = JobQueue::new(store.clone(), queue.clone());
        let scheduler = Scheduler::new(queue, config, jobs);
        Harness {
            _dir: dir,
            store,
            scheduler,
        }
    }

    fn seed_memory(
        store: &Store,
        id: &str,
        level: MemoryLevel,
        importance: f64,
        last_referenced_days_ago: i64,
    ) {
        let now = Utc::now();
        store
            .insert_memory(&MemoryRecord {
                id: id.into(),
                content: format!("The user remembers fact number {id} precisely."),
                level,
                category: MemoryCategory::Preferences,
                importance_score: importance,
                confidence_score: 0.9,
                privacy: Privacy::Public,
                tags: vec![],
                source_llm: "claude".into(),
                source_conversation_id: None,
                version: 1,
                status: MemoryStatus::Active,
                created_at: now,
                updated_at: now,
                last_referenced_at: now - Duration::days(last_referenced_days_ago),
                reference_count: 0,
                decay_profile: DecayProfile::Stable,
                expires_at: None,
                needs_review: false,
                review_due_at: None,
                event_date: None,
                source_message_id: None,
                source_excerpt: None,
                suggestion_reason: None,
                review_note: None,
                embedding: Embedding::zero(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn decay_reduces_importance_per_level() {
        let harness = setup();
        seed_memory(&harness.store, "episodic", MemoryLevel::Episodic, 0.5, 30);
        seed_memory(&harness.store, "semantic", MemoryLevel::Semantic, 0.5, 30);

        let stats = harness.scheduler.run_decay_sweep().await.unwrap();
        assert_eq!(stats.scanned, 2);

        // Episodic decays fast (k = 0.05): 0.5 * e^-1.5 ~= 0.112.
        let episodic = harness.store.get_memory("episodic").unwrap().unwrap();
        assert!(episodic.importance_score < 0.15);
        assert!(episodic.importance_score > 0.05);

        // Semantic decays slowly (k = 0.001): barely moves in 30 days.
        let semantic = harness.store.get_memory("semantic").unwrap().unwrap();
        assert!(semantic.importance_score > 0.45);
    }

    #[tokio::test]
    async fn decay_never_increases_importance() {
        let harness = setup();
        // Below the semantic floor already; the floor must not raise it.
        seed_memory(&harness.store, "low", MemoryLevel::Semantic, 0.05, 10);

        harness.scheduler.run_decay_sweep().await.unwrap();
        let memory = harness.store.get_memory("low").unwrap().unwrap();
        assert!(memory.importance_score <= 0.05);
    }

    #[tokio::test]
    async fn decayed_working_memories_are_archived() {
        let harness = setup();
        seed_memory(&harness.store, "working", MemoryLevel::Working, 0.5, 30);

        let stats = harness.scheduler.run_decay_sweep().await.unwrap();
        assert_eq!(stats.archived, 1);
        let memory = harness.store.get_memory("working").unwrap().unwrap();
        assert_eq!(memory.status, MemoryStatus::Archived);
    }

    #[tokio::test]
    async fn small_changes_are_skipped() {
        let harness = setup();
        // Referenced just now: retention ~= 1, delta below 0.001.
        seed_memory(&harness.store, "fresh", MemoryLevel::Semantic, 0.5, 0);
        let stats = harness.scheduler.run_decay_sweep().await.unwrap();
        assert_eq!(stats.updated, 0);
    }

    #[tokio::test]
    async fn maintenance_purges_old_sessions() {
        let harness = setup();
        let old = Utc::now() - Duration::days(45);
        harness
            .store
            .insert_session(&crate::storage::SessionRecord {
                id: "old".into(),
                api_key_id: "k".into(),
                source_llm: "claude".into(),
                started_at: old,
                ended_at: Some(old),
                end_reason: Some("expired".into()),
                memory_ids_read: vec![],
                memory_ids_written: vec![],
                memory_ids_feedback: vec![],
            })
            .unwrap();

        harness.scheduler.run_weekly_maintenance().await.unwrap();
        assert!(harness.store.get_session("old").unwrap().is_none());
    }

    #[test]
    fn state_round_trips_as_json() {
        let state = SchedulerState {
            last_decay: Some(Utc::now()),
            last_maintenance: None,
            last_token_rotation: Some(Utc::now()),
            last_auto_analysis: None,
            last_decay_stats: Some(DecaySweepStats {
                scanned: 10,
                updated: 3,
                archived: 1,
            }),
        };
        let raw = serde_json::to_string(&state).unwrap();
        let parsed: SchedulerState = serde_json::from_str(&raw).unwrap();
        assert!(parsed.last_decay.is_some());
        assert!(parsed.last_maintenance.is_none());
        assert_eq!(parsed.last_decay_stats.unwrap().updated, 3);
    }

    #[test]
    fn elapsed_handles_missing_timestamps() {
        let now = Utc::now();
        assert!(elapsed(None, Duration::hours(20), now));
        assert!(!elapsed(Some(now), Duration::hours(20), now));
        assert!(elapsed(
            Some(now - Duration::hours(21)),
            Duration::hours(20),
            now
        ));
    }
}
