//! Memory lifecycle journey: write, dedup, merge, version, archive,
//! restore, feedback, search, snapshot.

use mnesis_e2e::TestHarness;
use mnesis_core::{CreateMemoryParams, MemoryStatus};

#[tokio::test]
async fn exact_duplicate_is_skipped_without_a_new_row() {
    let harness = TestHarness::new();
    let content = "The user prefers concise technical answers with direct action items.";

    let first = harness.write_memory(content, "preferences").await;
    assert_eq!(first.action, "created");
    assert_eq!(first.status, "active");

    // Re-inserting identical content returns the original id and writes
    // nothing.
    let second = harness.write_memory(content, "preferences").await;
    assert_eq!(second.action, "skipped");
    assert_eq!(second.id, first.id);
    assert_eq!(harness.store.count_memories(None).unwrap(), 1);
}

#[tokio::test]
async fn near_duplicate_merges_and_keeps_max_importance() {
    let harness = TestHarness::new();

    let mut first = CreateMemoryParams::new(
        "The user prefers concise technical answers.",
        "preferences",
        "semantic",
        "claude",
    );
    first.confidence_score = 0.9;
    first.importance_score = 0.4;
    let created = harness.core.create_memory(first).await.unwrap();

    let mut second = CreateMemoryParams::new(
        "The user prefers concise technical answers!",
        "preferences",
        "semantic",
        "claude",
    );
    second.confidence_score = 0.9;
    second.importance_score = 0.8;
    let merged = harness.core.create_memory(second).await.unwrap();

    assert_eq!(merged.action, "merged");
    assert_eq!(merged.id, created.id);
    let row = harness
        .core
        .get_memory(&created.id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(row.importance_score, 0.8);
}

#[tokio::test]
async fn low_confidence_semantic_memories_need_review() {
    let harness = TestHarness::new();

    let mut low = CreateMemoryParams::new(
        "The user enjoys long-distance trail running.",
        "preferences",
        "semantic",
        "claude",
    );
    low.confidence_score = 0.70;
    let outcome = harness.core.create_memory(low).await.unwrap();
    assert_eq!(outcome.status, "pending_review");

    let mut high = CreateMemoryParams::new(
        "The user enjoys alpine climbing in winter.",
        "preferences",
        "semantic",
        "claude",
    );
    high.confidence_score = 0.90;
    let outcome = harness.core.create_memory(high).await.unwrap();
    assert_eq!(outcome.status, "active");
}

#[tokio::test]
async fn update_twice_builds_a_gap_free_version_chain() {
    let harness = TestHarness::new();
    let id = harness
        .write_memory("The user works from home on Fridays usually.", "preferences")
        .await
        .id
        .unwrap();

    let content = "The user works from home on Thursdays usually.";
    let first = harness
        .core
        .update_memory(&id, content, "claude", None)
        .await
        .unwrap();
    assert_eq!(first.version, Some(2));

    // Updating with identical content still archives a version and bumps.
    let second = harness
        .core
        .update_memory(&id, content, "claude", None)
        .await
        .unwrap();
    assert_eq!(second.version, Some(3));

    let versions = harness.store.versions_for(&id).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(
        versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![1, 2]
    );
    // The duplicate snapshot is expected: version 2 content equals the
    // current content.
    assert_eq!(versions[1].content, content);
}

#[tokio::test]
async fn archive_and_restore_round_trip() {
    let harness = TestHarness::new();
    let id = harness
        .write_memory("The user archives old notebooks every quarter.", "history")
        .await
        .id
        .unwrap();

    // Delete twice: idempotent, one archived row, no errors.
    harness.core.delete_memory(&id).await.unwrap();
    let second = harness.core.delete_memory(&id).await.unwrap();
    assert_eq!(second.status, "archived");
    assert_eq!(
        harness.store.count_memories(Some(MemoryStatus::Archived)).unwrap(),
        1
    );

    // Archived memories are invisible to search.
    let hits = harness
        .core
        .search_memories("old notebooks", 10, None, None)
        .await
        .unwrap();
    assert!(hits.is_empty());

    // Explicit restore is the only way back.
    harness.core.restore_memory(&id).await.unwrap();
    let restored = harness.core.get_memory(&id).unwrap().unwrap();
    assert_eq!(restored.status, MemoryStatus::Active);
}

#[tokio::test]
async fn feedback_raises_and_search_ranks() {
    let harness = TestHarness::new();
    let tea = harness
        .write_memory("The user prefers green tea over coffee.", "preferences")
        .await
        .id
        .unwrap();
    harness
        .write_memory("The user hikes in the mountains every October.", "history")
        .await;

    let hits = harness
        .core
        .search_memories("tea preferences of the user", 10, None, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].memory.id, tea);

    let before = harness.core.get_memory(&tea).unwrap().unwrap();
    harness
        .core
        .process_feedback(&[tea.clone()], None)
        .await
        .unwrap();
    let after = harness.core.get_memory(&tea).unwrap().unwrap();
    assert!(after.importance_score > before.importance_score);

    // Search with limit 0 is empty; an oversized limit returns all active.
    assert!(harness
        .core
        .search_memories("anything", 0, None, None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        harness
            .core
            .search_memories("the user", 50, None, None)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn snapshot_respects_context_ordering() {
    let harness = TestHarness::new();
    harness
        .write_memory("The user's name is Julien.", "identity")
        .await;
    harness
        .write_memory("The user is building the HomeBoard dashboard.", "projects")
        .await;
    harness
        .write_memory("Camille reviews the user's designs weekly.", "relationships")
        .await;

    let snapshot = harness.core.get_snapshot(Some("development")).await.unwrap();
    let identity = snapshot.find("## Identity").expect("identity section");
    let projects = snapshot.find("## Active Projects").expect("projects section");
    let relationships = snapshot
        .find("## Key Relationships")
        .expect("relationships section");
    // Development context: identity, then projects, relationships last.
    assert!(identity < projects);
    assert!(projects < relationships);
}

#[tokio::test]
async fn session_accounting_tracks_reads_writes_feedback() {
    let harness = TestHarness::new();
    let session_id = harness
        .core
        .sessions()
        .start_session("claude", Some("key-1"))
        .unwrap();

    let mut params = CreateMemoryParams::new(
        "The user prefers green tea over coffee.",
        "preferences",
        "semantic",
        "claude",
    );
    params.confidence_score = 0.9;
    params.session_id = Some(session_id.clone());
    let id = harness.core.create_memory(params).await.unwrap().id.unwrap();

    harness
        .core
        .search_memories("green tea", 5, None, Some(&session_id))
        .await
        .unwrap();
    harness
        .core
        .process_feedback(&[id.clone()], Some(&session_id))
        .await
        .unwrap();

    let session = harness.core.sessions().get(&session_id).unwrap().unwrap();
    assert_eq!(session.memory_ids_written, vec![id.clone()]);
    assert_eq!(session.memory_ids_read, vec![id.clone()]);
    assert_eq!(session.memory_ids_feedback, vec![id]);
    assert_eq!(session.end_reason.as_deref(), Some("feedback_called"));
}
