//! Mining pipeline journey: transcript in, pending-review suggestion out,
//! with incremental skipping and the durable job queue in between.

use mnesis_e2e::TestHarness;
use mnesis_core::{MemoryStatus, MiningRun};

#[tokio::test]
async fn dry_run_then_real_run_promote_the_same_facts() {
    let harness = TestHarness::new();
    harness.seed_conversation(
        "c1",
        &["My name is Julien and I work remotely from Lyon."],
    );

    // Dry run: candidates surface in the preview, nothing is written.
    let dry = harness
        .miner
        .mine(TestHarness::mining_options(true))
        .await
        .unwrap();
    assert!(dry.candidates_total >= 1);
    assert_eq!(dry.write_stats.created, 0);
    assert_eq!(harness.store.count_memories(None).unwrap(), 0);
    let dry_contents: Vec<String> = dry
        .preview
        .iter()
        .filter_map(|p| p["content"].as_str().map(str::to_string))
        .collect();

    // Real run: the same facts land as pending_review memories.
    let real = harness
        .miner
        .mine(TestHarness::mining_options(false))
        .await
        .unwrap();
    assert!(real.write_stats.created >= 1);
    let pending = harness
        .store
        .memories_with_status(MemoryStatus::PendingReview, 10)
        .unwrap();
    assert_eq!(pending.len(), real.write_stats.created);
    for memory in &pending {
        assert!(
            dry_contents.contains(&memory.content),
            "promoted memory was not previewed: {}",
            memory.content
        );
        assert_eq!(memory.source_conversation_id.as_deref(), Some("c1"));
    }
}

#[tokio::test]
async fn miner_preview_rewrites_first_person() {
    let harness = TestHarness::new();
    harness.seed_conversation(
        "c1",
        &["I prefer concise technical answers with direct action items."],
    );

    let report = harness
        .miner
        .mine(TestHarness::mining_options(true))
        .await
        .unwrap();
    assert!(report.candidates_total >= 1);
    let content = report.preview[0]["content"].as_str().unwrap();
    assert!(content.starts_with("The user prefers concise technical answers"));
}

#[tokio::test]
async fn unchanged_conversations_are_skipped_on_the_second_run() {
    let harness = TestHarness::new();
    harness.seed_conversation(
        "c1",
        &["I prefer concise technical answers with direct action items."],
    );
    harness.seed_conversation("c2", &["I am building a HomeBoard dashboard for my family."]);

    let first = harness
        .miner
        .mine(TestHarness::mining_options(false))
        .await
        .unwrap();
    assert_eq!(first.conversations_selected, 2);

    let second = harness
        .miner
        .mine(TestHarness::mining_options(false))
        .await
        .unwrap();
    assert_eq!(second.skipped_by_index, second.conversations_scanned);
    assert_eq!(second.conversations_selected, 0);
}

#[tokio::test]
async fn low_confidence_single_evidence_candidates_wait_in_the_store() {
    let harness = TestHarness::new();
    // A 0.80-confidence skill claim with one sighting stays below the
    // promotion gate; it accumulates in the candidate store instead.
    harness.seed_conversation(
        "c1",
        &["I use Rust and TypeScript for most of my backend work these days."],
    );

    let report = harness
        .miner
        .mine(TestHarness::mining_options(false))
        .await
        .unwrap();
    assert!(report.candidates_total >= 1);
    assert_eq!(report.write_stats.created, 0);
    assert_eq!(harness.store.count_memories(None).unwrap(), 0);
    assert!(harness.store.count_candidates(Some("pending")).unwrap() >= 1);
}

#[tokio::test]
async fn job_queue_runs_mining_end_to_end() {
    let harness = TestHarness::new();
    harness.seed_conversation(
        "c1",
        &["My name is Julien and I work remotely from Lyon."],
    );

    let enqueued = harness
        .jobs
        .enqueue("manual", TestHarness::mining_options(false), 0, 2, None, true)
        .await
        .unwrap();
    assert_eq!(enqueued.status, "accepted");

    // A second identical enqueue is deduplicated while the first is active.
    let duplicate = harness
        .jobs
        .enqueue("manual", TestHarness::mining_options(false), 0, 2, None, true)
        .await
        .unwrap();
    assert_eq!(duplicate.status, "duplicate");

    assert!(harness.worker.tick().await.unwrap());
    let job = harness.jobs.get(&enqueued.job.id).unwrap().unwrap();
    assert_eq!(job.status, "completed");
    assert!(
        job.result["write_stats"]["created"].as_u64().unwrap() >= 1,
        "job result: {}",
        job.result
    );
    assert!(
        harness
            .store
            .memories_with_status(MemoryStatus::PendingReview, 10)
            .unwrap()
            .len()
            >= 1
    );
}

#[tokio::test]
async fn singleflight_reports_busy_to_impatient_callers() {
    let harness = TestHarness::new();
    let run = harness
        .miner
        .run_singleflight("manual", false, TestHarness::mining_options(true))
        .await
        .unwrap();
    assert!(matches!(run, MiningRun::Completed(_)));

    let status = harness.miner.runtime_status();
    assert!(!status.running);
    assert!(status.last_result_summary.is_some());
}
