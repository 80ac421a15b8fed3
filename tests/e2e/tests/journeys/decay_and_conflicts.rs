//! Decay + conflict journey: contradictions open pending conflicts, the
//! workbench resolves them, and decay sweeps erode importance without ever
//! raising it.

use mnesis_e2e::TestHarness;
use mnesis_core::{ConflictResolution, CreateMemoryParams, DecayProfile, MemoryStatus};

#[tokio::test]
async fn contradiction_opens_exactly_one_pending_conflict() {
    let harness = TestHarness::new();

    let first = harness
        .write_memory("Julien prefers Python for backend services.", "preferences")
        .await;
    assert_eq!(first.action, "created");

    let second = harness
        .write_memory(
            "Julien does not prefer Python for backend services.",
            "preferences",
        )
        .await;
    assert_eq!(second.action, "created_with_conflict");

    let pending = harness.workbench.list_pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].memory_id_a, first.id.clone().unwrap());
    assert_eq!(pending[0].memory_id_b, second.id.clone().unwrap());
    assert!(pending[0].similarity_score >= 0.75);
    assert!(pending[0].similarity_score <= 0.92);
}

#[tokio::test]
async fn merged_resolution_rewrites_existing_and_archives_candidate() {
    let harness = TestHarness::new();
    let existing = harness
        .write_memory("Julien prefers Python for backend services.", "preferences")
        .await
        .id
        .unwrap();
    harness
        .write_memory(
            "Julien does not prefer Python for backend services.",
            "preferences",
        )
        .await;

    let conflict = harness.workbench.list_pending(1).unwrap()[0].clone();
    harness
        .workbench
        .resolve(
            &harness.core,
            &conflict.id,
            ConflictResolution::Merged,
            Some("Julien prefers Python for scripting but not for backend services."),
            "reviewer",
        )
        .await
        .unwrap();

    let merged = harness.core.get_memory(&existing).unwrap().unwrap();
    assert_eq!(merged.version, 2);
    assert!(merged.content.contains("scripting"));
    let candidate = harness
        .core
        .get_memory(&conflict.memory_id_b)
        .unwrap()
        .unwrap();
    assert_eq!(candidate.status, MemoryStatus::Archived);
    assert!(harness.workbench.list_pending(10).unwrap().is_empty());
}

#[tokio::test]
async fn event_dated_content_gets_event_based_decay() {
    let harness = TestHarness::new();
    let id = harness
        .write_memory("Project review scheduled on 2099-03-10.", "projects")
        .await
        .id
        .unwrap();

    let memory = harness.core.get_memory(&id).unwrap().unwrap();
    assert_eq!(memory.decay_profile, DecayProfile::EventBased);
    let event = memory.event_date.expect("event date");
    assert_eq!(event.to_rfc3339(), "2099-03-10T09:00:00+00:00");
    assert_eq!(
        memory.expires_at.expect("expiry"),
        event + chrono::Duration::days(1)
    );
}

#[tokio::test]
async fn decay_sweep_is_monotonic_and_feedback_recovers() {
    let harness = TestHarness::new();
    let id = harness
        .write_memory("The user prefers green tea over coffee.", "preferences")
        .await
        .id
        .unwrap();

    let before = harness.core.get_memory(&id).unwrap().unwrap().importance_score;
    harness.scheduler.run_decay_sweep().await.unwrap();
    let after_sweep = harness.core.get_memory(&id).unwrap().unwrap().importance_score;
    assert!(after_sweep <= before);

    harness
        .core
        .process_feedback(&[id.clone()], None)
        .await
        .unwrap();
    let after_feedback = harness.core.get_memory(&id).unwrap().unwrap().importance_score;
    assert!(after_feedback >= after_sweep);
}

#[tokio::test]
async fn pending_review_memories_keep_their_conflicts_valid() {
    let harness = TestHarness::new();

    // A low-confidence insert lands in pending_review and can still be the
    // existing side of a conflict.
    let mut low = CreateMemoryParams::new(
        "Julien prefers Python for backend services.",
        "preferences",
        "semantic",
        "claude",
    );
    low.confidence_score = 0.7;
    let first = harness.core.create_memory(low).await.unwrap();
    assert_eq!(first.status, "pending_review");

    // The conflict band only scans active memories, so the contradiction
    // of a pending_review memory creates no conflict row.
    let second = harness
        .write_memory(
            "Julien does not prefer Python for backend services.",
            "preferences",
        )
        .await;
    assert_eq!(second.action, "created");
    assert!(harness.workbench.list_pending(10).unwrap().is_empty());
}
