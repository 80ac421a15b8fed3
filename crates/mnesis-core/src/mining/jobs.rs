//! Analysis Job Queue
//!
//! Durable, priority-ordered job table with single-flight execution and
//! crash recovery. The queue prevents overlapping *pending* work (dedupe
//! keys); the miner's in-process lock prevents overlapping *execution*.
//! Keeping both lets callers accept new work while a long run finishes,
//! without double-execution.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use super::{Miner, MiningOptions, MiningRun};
use crate::memory::write_queue::WriteQueue;
use crate::storage::{JobRecord, Result, Store};

/// Trigger prefix used by the scheduler's automatic runs.
pub const AUTO_TRIGGER_PREFIX: &str = "auto";

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    /// `accepted` or `duplicate`.
    pub status: String,
    pub job: JobRecord,
}

// ============================================================================
// JOB QUEUE
// ============================================================================

/// Durable job queue over the analysis_jobs table.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<Store>,
    queue: WriteQueue,
}

impl JobQueue {
    pub fn new(store: Arc<Store>, queue: WriteQueue) -> Self {
        Self { store, queue }
    }

    /// Enqueue a mining job.
    ///
    /// When `dedupe_active` and an existing pending/running job carries the
    /// same dedupe key, that job is returned with status `duplicate` and
    /// nothing is inserted. Invariant: at most one job per dedupe key is in
    /// `{pending, running}`.
    pub async fn enqueue(
        &self,
        trigger: &str,
        payload: MiningOptions,
        priority: i64,
        max_attempts: i64,
        dedupe_key: Option<String>,
        dedupe_active: bool,
    ) -> Result<EnqueueOutcome> {
        let trigger = if trigger.trim().is_empty() {
            "manual".to_string()
        } else {
            trigger.trim().to_string()
        };
        let payload_value = serde_json::to_value(&payload).unwrap_or_default();
        let dedupe_key = dedupe_key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| build_dedupe_key(&trigger, &payload_value));
        let priority = priority.clamp(-20, 20);
        let max_attempts = max_attempts.clamp(1, 6);

        self.queue
            .enqueue(move |store| {
                if dedupe_active {
                    if let Some(existing) = store.active_job_with_dedupe_key(&dedupe_key)? {
                        return Ok(EnqueueOutcome {
                            status: "duplicate".to_string(),
                            job: existing,
                        });
                    }
                }

                let now = Utc::now();
                let job = JobRecord {
                    id: Uuid::new_v4().to_string(),
                    trigger: trigger.clone(),
                    status: JobStatus::Pending.as_str().to_string(),
                    priority,
                    dedupe_key: dedupe_key.clone(),
                    payload: payload_value.clone(),
                    result: serde_json::Value::Null,
                    error: String::new(),
                    attempt_count: 0,
                    max_attempts,
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    completed_at: None,
                };
                store.insert_job(&job)?;
                Ok(EnqueueOutcome {
                    status: "accepted".to_string(),
                    job,
                })
            })
            .await
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.store.get_job(job_id)
    }

    /// Status counts plus the most recent jobs.
    pub fn overview(&self, limit: usize) -> Result<serde_json::Value> {
        let counts = self.store.job_status_counts()?;
        let recent = self.store.recent_jobs(limit.clamp(1, 80))?;
        let count_of = |status: JobStatus| counts.get(status.as_str()).copied().unwrap_or(0);
        Ok(serde_json::json!({
            "counts": {
                "pending": count_of(JobStatus::Pending),
                "running": count_of(JobStatus::Running),
                "completed": count_of(JobStatus::Completed),
                "failed": count_of(JobStatus::Failed),
                "cancelled": count_of(JobStatus::Cancelled),
            },
            "recent": recent,
        }))
    }

    /// Cancel a job. Only pending jobs transition to `cancelled`; running
    /// jobs ignore cancellation (crash recovery handles abandoned runs).
    pub async fn cancel(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let job_id = job_id.to_string();
        self.queue
            .enqueue(move |store| store.cancel_job_if_pending(&job_id, Utc::now()))
            .await
    }

    /// Whether any pending/running job carries the trigger prefix.
    pub fn has_active_with_trigger(&self, prefix: &str) -> Result<bool> {
        self.store.has_active_job_with_trigger_prefix(prefix)
    }

    /// Startup recovery: every `running` row left behind by a dead process
    /// is rewound to `pending` (attempts remaining) or `failed`.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        self.queue
            .enqueue(|store| {
                let now = Utc::now();
                let running = store.running_jobs()?;
                let mut recovered = 0usize;
                for job in running {
                    let note = "Recovered after application restart during execution.";
                    let error = if job.error.is_empty() {
                        note.to_string()
                    } else {
                        format!("{} {note}", job.error)
                    };
                    if job.attempt_count < job.max_attempts {
                        store.requeue_job(&job.id, &error, now)?;
                    } else {
                        store.finish_job(
                            &job.id,
                            JobStatus::Failed.as_str(),
                            &serde_json::Value::Null,
                            &error,
                            now,
                        )?;
                    }
                    recovered += 1;
                }
                Ok(recovered)
            })
            .await
    }

    /// Claim the highest-priority pending job (FIFO within equal priority).
    async fn claim_next(&self) -> Result<Option<JobRecord>> {
        let Some(next) = self.store.next_pending_job()? else {
            return Ok(None);
        };
        let job_id = next.id;
        self.queue
            .enqueue(move |store| store.claim_job(&job_id, Utc::now()))
            .await
    }

    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        result: serde_json::Value,
        error: String,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        self.queue
            .enqueue(move |store| {
                store.finish_job(&job_id, status.as_str(), &result, &error, Utc::now())
            })
            .await
    }

    async fn requeue(&self, job_id: &str, error: String) -> Result<()> {
        let job_id = job_id.to_string();
        self.queue
            .enqueue(move |store| store.requeue_job(&job_id, &error, Utc::now()))
            .await
    }
}

fn build_dedupe_key(trigger: &str, payload: &serde_json::Value) -> String {
    let normalized = serde_json::json!({
        "trigger": trigger.to_lowercase(),
        "payload": payload,
    });
    let mut hasher = Sha1::new();
    hasher.update(normalized.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// WORKER
// ============================================================================

/// The single job worker: recovery on startup, then claim-execute-finish.
pub struct JobWorker {
    jobs: JobQueue,
    miner: Arc<Miner>,
}

impl JobWorker {
    pub fn new(jobs: JobQueue, miner: Arc<Miner>) -> Self {
        Self { jobs, miner }
    }

    /// Spawn the worker loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.jobs.recover_interrupted().await {
                tracing::error!("Job recovery failed: {}", e);
            }
            tracing::info!("Conversation analysis worker started");
            loop {
                match self.tick().await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(std::time::Duration::from_secs(1)).await,
                    Err(e) => {
                        tracing::error!("Job worker loop error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
                    }
                }
            }
        })
    }

    /// Claim and execute at most one job. Returns whether a job ran.
    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.jobs.claim_next().await? else {
            return Ok(false);
        };
        let job_id = job.id.clone();
        if let Err(e) = self.run_job(&job).await {
            tracing::warn!("Conversation analysis job {} failed: {}", job_id, e);
        }
        Ok(true)
    }

    async fn run_job(&self, job: &JobRecord) -> Result<()> {
        let options: MiningOptions =
            serde_json::from_value(job.payload.clone()).unwrap_or_default();

        let run = self
            .miner
            .run_singleflight(&job.trigger, true, options.clone())
            .await;

        match run {
            Ok(MiningRun::Completed(mut report)) => {
                // Auto runs that produced nothing but rejections get one
                // heuristic retry; its result is adopted when it created at
                // least as much.
                if should_try_heuristic_fallback(&job.trigger, &options, &report) {
                    let mut fallback_options = options.clone();
                    fallback_options.provider = "heuristic".to_string();
                    fallback_options.force_reanalyze = true;
                    if let Ok(MiningRun::Completed(fallback)) = self
                        .miner
                        .run_singleflight(&job.trigger, true, fallback_options)
                        .await
                    {
                        if fallback.write_stats.created >= report.write_stats.created {
                            report = fallback;
                        }
                    }
                }
                let result = serde_json::to_value(&report).unwrap_or_default();
                self.jobs
                    .finish(&job.id, JobStatus::Completed, result, String::new())
                    .await
            }
            Ok(MiningRun::Busy { message }) => self.handle_failure(job, message).await,
            Err(e) => self.handle_failure(job, e.to_string()).await,
        }
    }

    async fn handle_failure(&self, job: &JobRecord, error: String) -> Result<()> {
        let error = if error.trim().is_empty() {
            "Conversation analysis run failed.".to_string()
        } else {
            error
        };
        if job.attempt_count < job.max_attempts {
            self.jobs.requeue(&job.id, error).await
        } else {
            self.jobs
                .finish(&job.id, JobStatus::Failed, serde_json::Value::Null, error)
                .await
        }
    }
}

/// §Fallback rule: an automatic LLM run whose only outcome was rejections
/// gets retried once with heuristics.
fn should_try_heuristic_fallback(
    trigger: &str,
    options: &MiningOptions,
    report: &super::MiningReport,
) -> bool {
    let configured_provider = options.provider.trim().to_lowercase();
    trigger.to_lowercase().starts_with(AUTO_TRIGGER_PREFIX)
        && !options.require_llm_configured.unwrap_or(true)
        && !configured_provider.is_empty()
        && configured_provider != "heuristic"
        && report.status != "blocked"
        && report.write_stats.created == 0
        && report.write_stats.merged == 0
        && report.write_stats.skipped == 0
        && report.write_stats.conflict_pending == 0
        && report.write_stats.rejected > 0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHandle;
    use crate::embeddings::EmbeddingService;
    use crate::memory::core::MemoryCore;
    use crate::storage::{ConversationRecord, MessageRecord};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        jobs: JobQueue,
        worker: JobWorker,
    }

    fn setup() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("jobs.db"))).unwrap());
        let embedder = Arc::new(EmbeddingService::hashed());
        let queue = WriteQueue::start(store.clone());
        let core = Arc::new(MemoryCore::new(store.clone(), embedder.clone(), queue.clone()));
        let miner = Arc::new(Miner::new(
            store.clone(),
            core,
            embedder,
            Arc::new(ConfigHandle::new()),
        ));
        let jobs = JobQueue::new(store.clone(), queue);
        let worker = JobWorker::new(jobs.clone(), miner);
        Harness {
            _dir: dir,
            store,
            jobs,
            worker,
        }
    }

    fn heuristic_payload() -> MiningOptions {
        MiningOptions {
            dry_run: true,
            provider: "heuristic".to_string(),
            require_llm_configured: Some(false),
            ..MiningOptions::default()
        }
    }

    #[tokio::test]
    async fn dedupe_key_blocks_double_enqueue() {
        let harness = setup();
        let first = harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, true)
            .await
            .unwrap();
        assert_eq!(first.status, "accepted");

        let second = harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, true)
            .await
            .unwrap();
        assert_eq!(second.status, "duplicate");
        assert_eq!(second.job.id, first.job.id);

        // Different payloads produce different keys.
        let mut other = heuristic_payload();
        other.max_conversations = 7;
        let third = harness
            .jobs
            .enqueue("manual", other, 0, 2, None, true)
            .await
            .unwrap();
        assert_eq!(third.status, "accepted");
    }

    #[tokio::test]
    async fn dedupe_can_be_disabled() {
        let harness = setup();
        harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, true)
            .await
            .unwrap();
        let second = harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, false)
            .await
            .unwrap();
        assert_eq!(second.status, "accepted");
    }

    #[tokio::test]
    async fn tick_runs_and_completes_a_job() {
        let harness = setup();
        let now = Utc::now();
        harness
            .store
            .upsert_conversation(&ConversationRecord {
                id: "c1".into(),
                title: "Chat".into(),
                source_llm: "claude".into(),
                started_at: now,
                ended_at: None,
                message_count: 1,
                summary: String::new(),
                status: "archived".into(),
                tags: vec![],
                memory_ids: vec![],
                raw_file_hash: "h1".into(),
                imported_at: now,
            })
            .unwrap();
        harness
            .store
            .insert_messages(&[MessageRecord {
                id: "m1".into(),
                conversation_id: "c1".into(),
                role: "user".into(),
                content: "I prefer concise technical answers with direct action items.".into(),
                timestamp: now,
                embedding: None,
            }])
            .unwrap();

        let enqueued = harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, true)
            .await
            .unwrap();

        assert!(harness.worker.tick().await.unwrap());
        let job = harness.jobs.get(&enqueued.job.id).unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!(job.attempt_count, 1);
        assert!(job.completed_at.is_some());
        assert!(job.result.get("candidates_total").is_some());

        // Queue drained.
        assert!(!harness.worker.tick().await.unwrap());
    }

    #[tokio::test]
    async fn recovery_rewinds_or_fails_running_jobs() {
        let harness = setup();
        let now = Utc::now();
        for (id, attempts, max_attempts) in [("retryable", 1i64, 2i64), ("exhausted", 2, 2)] {
            harness
                .store
                .insert_job(&JobRecord {
                    id: id.into(),
                    trigger: "manual".into(),
                    status: "running".into(),
                    priority: 0,
                    dedupe_key: format!("k-{id}"),
                    payload: serde_json::to_value(heuristic_payload()).unwrap(),
                    result: serde_json::Value::Null,
                    error: String::new(),
                    attempt_count: attempts,
                    max_attempts,
                    created_at: now,
                    updated_at: now,
                    started_at: Some(now),
                    completed_at: None,
                })
                .unwrap();
        }

        assert_eq!(harness.jobs.recover_interrupted().await.unwrap(), 2);

        let retryable = harness.jobs.get("retryable").unwrap().unwrap();
        assert_eq!(retryable.status, "pending");
        assert!(retryable.error.contains("Recovered after application restart"));
        assert!(retryable.started_at.is_none());

        let exhausted = harness.jobs.get("exhausted").unwrap().unwrap();
        assert_eq!(exhausted.status, "failed");
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_jobs() {
        let harness = setup();
        let enqueued = harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, true)
            .await
            .unwrap();

        let cancelled = harness.jobs.cancel(&enqueued.job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, "cancelled");

        // Cancelling again is a no-op report of the current state.
        let again = harness.jobs.cancel(&enqueued.job.id).await.unwrap().unwrap();
        assert_eq!(again.status, "cancelled");

        // Cancelled jobs are never claimed.
        assert!(!harness.worker.tick().await.unwrap());
    }

    #[tokio::test]
    async fn failed_attempts_requeue_until_exhausted() {
        let harness = setup();
        // An LLM-required payload with no runtime fails inside the run.
        let blocked_payload = MiningOptions {
            dry_run: false,
            provider: "heuristic".to_string(),
            require_llm_configured: Some(true),
            ..MiningOptions::default()
        };
        let enqueued = harness
            .jobs
            .enqueue("manual", blocked_payload, 0, 2, None, true)
            .await
            .unwrap();

        // A blocked run still completes the job (blocked is a result, not
        // an execution failure).
        assert!(harness.worker.tick().await.unwrap());
        let job = harness.jobs.get(&enqueued.job.id).unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!(job.result.get("status").and_then(|s| s.as_str()), Some("blocked"));
    }

    #[test]
    fn fallback_rule_matches_auto_llm_runs_with_only_rejections() {
        let options = MiningOptions {
            provider: "openai".to_string(),
            require_llm_configured: Some(false),
            ..MiningOptions::default()
        };
        let mut report = super::super::MiningReport {
            status: "ok".to_string(),
            ..Default::default()
        };
        report.write_stats.rejected = 3;

        assert!(should_try_heuristic_fallback("auto:interval", &options, &report));
        // Manual triggers never fall back.
        assert!(!should_try_heuristic_fallback("manual", &options, &report));
        // A created write disables the fallback.
        report.write_stats.created = 1;
        assert!(!should_try_heuristic_fallback("auto:interval", &options, &report));
    }

    #[tokio::test]
    async fn overview_reports_counts() {
        let harness = setup();
        harness
            .jobs
            .enqueue("manual", heuristic_payload(), 0, 2, None, true)
            .await
            .unwrap();
        let overview = harness.jobs.overview(10).unwrap();
        assert_eq!(overview["counts"]["pending"], 1);
        assert_eq!(overview["recent"].as_array().unwrap().len(), 1);
    }
}
