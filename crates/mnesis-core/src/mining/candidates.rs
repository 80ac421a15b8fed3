//! Candidate Store
//!
//! Durable dedup layer between extraction and promotion. Every mined fact
//! lands here first, keyed by a canonical category+level+text hash, with a
//! second semantic-dedup pass over candidate embeddings. Merges accumulate
//! evidence across conversations; promotion gates on a blended score.
//!
//! All mutations run inside the write queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text;
use super::ExtractedCandidate;
use crate::embeddings::{Embedding, EmbeddingService};
use crate::memory::{write_queue::WriteQueue, MemoryLevel};
use crate::storage::{MiningCandidateRecord, Result, Store};

/// Candidate lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    #[default]
    Pending,
    Promoted,
    Merged,
    ConflictPending,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Promoted => "promoted",
            CandidateStatus::Merged => "merged",
            CandidateStatus::ConflictPending => "conflict_pending",
            CandidateStatus::Rejected => "rejected",
        }
    }
}

/// Result of one upsert batch.
#[derive(Debug, Default)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub semantic_merged: usize,
    pub generic_filtered: usize,
    /// Every row inserted or refreshed by this batch, in batch order.
    pub touched: Vec<MiningCandidateRecord>,
}

/// Promotion outcome to record back onto a candidate.
#[derive(Debug, Clone)]
pub struct CandidateResultUpdate {
    pub candidate_id: String,
    pub status: CandidateStatus,
    pub result: String,
    pub error: String,
    pub promoted_memory_id: Option<String>,
}

// ============================================================================
// SCORING
// ============================================================================

/// Clamp a confidence into the accepted [0.5, 0.99] band.
pub fn normalize_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.5, 0.99)
    } else {
        0.8
    }
}

/// Promotion score: a [0, 0.99] blend of confidence, evidence volume,
/// conversation spread, recency, and a small semantic-level bonus.
pub fn promotion_score(
    confidence: f64,
    evidence_count: i64,
    conversation_count: usize,
    level: MemoryLevel,
    last_seen_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let confidence = normalize_confidence(confidence);
    let evidence_factor = (evidence_count.max(0).min(4) as f64) / 4.0;
    let conversation_factor = (conversation_count.min(3) as f64) / 3.0;
    let days_since_seen = ((now - last_seen_at).num_seconds() as f64 / 86_400.0).max(0.0);
    let recency_factor = (1.0 - days_since_seen / 60.0).clamp(0.0, 1.0);
    let level_bonus = if level == MemoryLevel::Semantic { 0.04 } else { 0.0 };
    let score = confidence * 0.52
        + evidence_factor * 0.23
        + conversation_factor * 0.17
        + recency_factor * 0.08
        + level_bonus;
    score.clamp(0.0, 0.99)
}

/// Promotion gate: threshold-based, with an escape hatch for
/// high-confidence one-shot facts.
pub fn is_promotable(
    row: &MiningCandidateRecord,
    min_score: f64,
    min_evidence: i64,
    min_conversations: usize,
) -> bool {
    if row.status != "pending" {
        return false;
    }
    let confidence = normalize_confidence(row.confidence_score);
    if row.evidence_count >= min_evidence.max(1)
        && row.conversation_count() >= min_conversations.max(1)
        && row.promotion_score >= min_score
    {
        return true;
    }
    confidence >= 0.93 && row.evidence_count >= 1 && row.promotion_score >= min_score * 0.9
}

/// Rank the promotable subset of a batch, bounded by `limit`. When nothing
/// clears the gate, a small fallback of high-confidence pending rows is
/// promoted instead so a cold store can still produce suggestions.
pub fn select_promotable(
    touched: &[MiningCandidateRecord],
    limit: usize,
    min_score: f64,
    min_evidence: i64,
    min_conversations: usize,
) -> Vec<MiningCandidateRecord> {
    let mut ranked: Vec<MiningCandidateRecord> = Vec::new();
    let mut fallback: Vec<MiningCandidateRecord> = Vec::new();

    for row in touched {
        if text::looks_generic_non_memory(&row.content) {
            continue;
        }
        if is_promotable(row, min_score, min_evidence, min_conversations) {
            ranked.push(row.clone());
        } else if row.status == "pending"
            && normalize_confidence(row.confidence_score) >= 0.9
            && row.promotion_score >= min_score * 0.88
        {
            fallback.push(row.clone());
        }
    }

    let key = |r: &MiningCandidateRecord| {
        (
            ordered(r.promotion_score),
            r.evidence_count,
            r.conversation_count() as i64,
            r.last_seen_at.timestamp(),
        )
    };
    ranked.sort_by(|a, b| key(b).partial_cmp(&key(a)).unwrap_or(std::cmp::Ordering::Equal));
    fallback.sort_by(|a, b| key(b).partial_cmp(&key(a)).unwrap_or(std::cmp::Ordering::Equal));

    if ranked.is_empty() {
        fallback.truncate(limit.clamp(1, 8));
        return fallback;
    }
    ranked.truncate(limit);
    ranked
}

fn ordered(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

// ============================================================================
// CANDIDATE STORE
// ============================================================================

/// Serialized access to the analysis_candidates table.
pub struct CandidateStore {
    queue: WriteQueue,
    embedder: Arc<EmbeddingService>,
}

impl CandidateStore {
    pub fn new(queue: WriteQueue, embedder: Arc<EmbeddingService>) -> Self {
        Self { queue, embedder }
    }

    /// Upsert a batch of extracted candidates.
    ///
    /// Per candidate: generic-fact filter, canonical-key lookup, semantic
    /// dedup against non-rejected candidates, then merge or insert.
    pub async fn upsert_candidates(
        &self,
        candidates: Vec<ExtractedCandidate>,
        source_provider: &str,
        source_llm: &str,
        semantic_dedupe_threshold: f64,
    ) -> Result<UpsertStats> {
        if candidates.is_empty() {
            return Ok(UpsertStats::default());
        }
        let threshold = semantic_dedupe_threshold.clamp(0.84, 0.99) as f32;
        let source_provider = source_provider.to_string();
        let source_llm = source_llm.to_string();
        let embedder = self.embedder.clone();

        self.queue
            .enqueue(move |store| {
                upsert_op(
                    store,
                    &embedder,
                    candidates,
                    &source_provider,
                    &source_llm,
                    threshold,
                )
            })
            .await
    }

    /// Record promotion outcomes on candidates.
    pub async fn update_results(&self, updates: Vec<CandidateResultUpdate>) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.queue
            .enqueue(move |store| {
                let now = Utc::now();
                let mut updated = 0usize;
                for item in &updates {
                    if item.candidate_id.is_empty() {
                        continue;
                    }
                    store.update_candidate_result(
                        &item.candidate_id,
                        item.status.as_str(),
                        &item.result,
                        &item.error,
                        item.promoted_memory_id.as_deref(),
                        now,
                    )?;
                    updated += 1;
                }
                Ok(updated)
            })
            .await
    }
}

fn upsert_op(
    store: &Store,
    embedder: &EmbeddingService,
    candidates: Vec<ExtractedCandidate>,
    source_provider: &str,
    source_llm: &str,
    threshold: f32,
) -> Result<UpsertStats> {
    let now = Utc::now();
    let mut stats = UpsertStats::default();
    let mut touched_ids: std::collections::HashSet<String> = std::collections::HashSet::new();

    for candidate in candidates {
        let content = candidate.content.trim().to_string();
        if content.is_empty() {
            continue;
        }
        if text::looks_generic_non_memory(&content) {
            stats.generic_filtered += 1;
            continue;
        }

        let category = candidate.category;
        let level = candidate.level;
        let confidence = normalize_confidence(candidate.confidence);
        let canonical_key = text::candidate_key(&content, category, level);
        let normalized_content = text::canonicalize_candidate_text(&content);
        let embedding = match embedder.embed(&content) {
            Ok(e) => e,
            Err(_) => Embedding::zero(),
        };
        let seen_at = candidate.source_message_timestamp.unwrap_or(now);

        // Canonical-key dedup catches punctuation/case variants cheaply;
        // embedding dedup below catches paraphrases. Both are needed.
        let mut matched = store.candidate_by_canonical_key(&canonical_key)?;

        if matched.is_none() && !embedding.is_zero() {
            let near = store.nearest_candidates(&embedding.vector, 12)?;
            for (row, distance) in near {
                let score = 1.0 - distance;
                if score < threshold {
                    continue;
                }
                if row.level != level {
                    continue;
                }
                if row.category != category && score < 0.96 {
                    continue;
                }
                matched = Some(row);
                stats.semantic_merged += 1;
                break;
            }
        }

        if let Some(existing) = matched {
            let evidence_count = existing.evidence_count.max(1) + 1;
            let conversation_ids = merge_unique(
                &existing.conversation_ids,
                &[candidate.conversation_id.clone()],
                96,
            );
            let source_message_ids = merge_unique(
                &existing.source_message_ids,
                &[candidate.source_message_id.clone()],
                160,
            );
            let methods = merge_unique(&existing.methods, &[candidate.method.clone()], 16);
            let merged_confidence =
                confidence.max(normalize_confidence(existing.confidence_score));
            let first_seen_at = existing.first_seen_at.min(seen_at);
            let last_seen_at = existing.last_seen_at.max(seen_at);
            let score = promotion_score(
                merged_confidence,
                evidence_count,
                conversation_ids.iter().filter(|v| !v.is_empty()).count(),
                level,
                last_seen_at,
                now,
            );
            // A previously-rejected fact earns another shot only with
            // strong corroboration.
            let status = if existing.status == "rejected" && score >= 0.86 && evidence_count >= 2
            {
                "pending".to_string()
            } else {
                existing.status.clone()
            };

            let merged_content =
                if text::content_quality_score(&content)
                    >= text::content_quality_score(&existing.content)
                {
                    content.clone()
                } else {
                    existing.content.clone()
                };

            let updated = MiningCandidateRecord {
                id: existing.id.clone(),
                canonical_key: existing.canonical_key.clone(),
                content: merged_content.clone(),
                normalized_content: text::canonicalize_candidate_text(&merged_content),
                category,
                level,
                confidence_score: merged_confidence,
                source_provider: source_provider.to_string(),
                source_llm: source_llm.to_string(),
                evidence_count,
                conversation_ids,
                source_message_ids,
                methods,
                first_seen_at,
                last_seen_at,
                promotion_score: score,
                status,
                promoted_memory_id: existing.promoted_memory_id.clone(),
                last_result: existing.last_result.clone(),
                last_error: String::new(),
                created_at: existing.created_at,
                updated_at: now,
                embedding: if embedding.is_zero() {
                    existing.embedding.clone()
                } else {
                    embedding
                },
            };
            store.update_candidate(&updated)?;
            stats.updated += 1;
            if touched_ids.insert(updated.id.clone()) {
                stats.touched.push(updated);
            }
            continue;
        }

        let row = MiningCandidateRecord {
            id: Uuid::new_v4().to_string(),
            canonical_key,
            content: content.clone(),
            normalized_content,
            category,
            level,
            confidence_score: confidence,
            source_provider: source_provider.to_string(),
            source_llm: source_llm.to_string(),
            evidence_count: 1,
            conversation_ids: if candidate.conversation_id.is_empty() {
                vec![]
            } else {
                vec![candidate.conversation_id.clone()]
            },
            source_message_ids: if candidate.source_message_id.is_empty() {
                vec![]
            } else {
                vec![candidate.source_message_id.clone()]
            },
            methods: vec![candidate.method.clone()],
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            promotion_score: promotion_score(
                confidence,
                1,
                usize::from(!candidate.conversation_id.is_empty()),
                level,
                seen_at,
                now,
            ),
            status: "pending".to_string(),
            promoted_memory_id: None,
            last_result: String::new(),
            last_error: String::new(),
            created_at: now,
            updated_at: now,
            embedding,
        };
        store.insert_candidate(&row)?;
        stats.inserted += 1;
        if touched_ids.insert(row.id.clone()) {
            stats.touched.push(row);
        }
    }

    Ok(stats)
}

fn merge_unique(existing: &[String], additions: &[String], max_items: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    for value in existing.iter().chain(additions.iter()) {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if !seen.insert(value.to_lowercase()) {
            continue;
        }
        out.push(value.to_string());
        if out.len() >= max_items {
            break;
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCategory;

    fn setup() -> (tempfile::TempDir, Arc<Store>, CandidateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("cand.db"))).unwrap());
        let queue = WriteQueue::start(store.clone());
        let embedder = Arc::new(EmbeddingService::hashed());
        (dir, store.clone(), CandidateStore::new(queue, embedder))
    }

    fn extracted(content: &str, conversation_id: &str) -> ExtractedCandidate {
        ExtractedCandidate {
            content: content.to_string(),
            category: MemoryCategory::Skills,
            level: MemoryLevel::Semantic,
            confidence: 0.85,
            source_message_id: format!("msg-{conversation_id}"),
            source_message_timestamp: Some(Utc::now()),
            source_excerpt: String::new(),
            conversation_id: conversation_id.to_string(),
            conversation_title: "Chat".to_string(),
            method: "heuristic".to_string(),
        }
    }

    #[tokio::test]
    async fn generic_candidates_are_filtered() {
        let (_dir, store, candidates) = setup();
        let stats = candidates
            .upsert_candidates(
                vec![
                    extracted(
                        "The user says C++ is a high-performance, compiled language that \
                         provides direct access to hardware resources such as memory and \
                         I/O operations.",
                        "c1",
                    ),
                    extracted("The user uses C++ daily for embedded systems at work.", "c1"),
                ],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();

        assert_eq!(stats.generic_filtered, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(store.count_candidates(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn canonical_key_merge_accumulates_evidence() {
        let (_dir, store, candidates) = setup();
        candidates
            .upsert_candidates(
                vec![extracted("The user uses Rust daily for systems work.", "c1")],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();
        // Punctuation/case variant from a second conversation merges.
        let stats = candidates
            .upsert_candidates(
                vec![extracted("The user uses Rust daily for systems work!", "c2")],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();

        assert_eq!(stats.updated, 1);
        assert_eq!(stats.inserted, 0);
        assert_eq!(store.count_candidates(None).unwrap(), 1);

        let row = &stats.touched[0];
        assert_eq!(row.evidence_count, 2);
        assert_eq!(row.conversation_count(), 2);
        assert!(row.promotion_score > 0.0);
    }

    #[tokio::test]
    async fn no_two_pending_candidates_share_a_canonical_key() {
        let (_dir, store, candidates) = setup();
        for _ in 0..3 {
            candidates
                .upsert_candidates(
                    vec![extracted("The user uses Rust daily for systems work.", "c1")],
                    "heuristic",
                    "conversation-analyzer:heuristic",
                    0.92,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.count_candidates(Some("pending")).unwrap(), 1);
    }

    #[tokio::test]
    async fn semantic_merge_requires_same_level() {
        let (_dir, store, candidates) = setup();
        candidates
            .upsert_candidates(
                vec![extracted("The user deploys the HomeBoard app with Docker.", "c1")],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();

        // Near-identical text but a different level stays separate.
        let mut other_level = extracted("The user deploys the HomeBoard app with Docker!", "c2");
        other_level.level = MemoryLevel::Working;
        let stats = candidates
            .upsert_candidates(
                vec![other_level],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(store.count_candidates(None).unwrap(), 2);
    }

    #[tokio::test]
    async fn merge_keeps_higher_quality_content() {
        let (_dir, _store, candidates) = setup();
        candidates
            .upsert_candidates(
                vec![extracted(
                    "The user blocks mornings for deep work because meetings drain focus.",
                    "c1",
                )],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();

        // The contextual variant (adds a time window) wins the merge.
        let richer = extracted(
            "The user blocks mornings for deep work because meetings drain focus \
             (09:00-12:00).",
            "c2",
        );
        let stats = candidates
            .upsert_candidates(
                vec![richer],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.86,
            )
            .await
            .unwrap();
        assert_eq!(stats.updated, 1);
        assert!(stats.touched[0].content.contains("09:00-12:00"));
    }

    #[tokio::test]
    async fn rejected_candidate_needs_corroboration_to_return() {
        let (_dir, store, candidates) = setup();
        let stats = candidates
            .upsert_candidates(
                vec![extracted("The user uses Rust daily for systems work.", "c1")],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();
        let id = stats.touched[0].id.clone();

        candidates
            .update_results(vec![CandidateResultUpdate {
                candidate_id: id.clone(),
                status: CandidateStatus::Rejected,
                result: "error".into(),
                error: "validation".into(),
                promoted_memory_id: None,
            }])
            .await
            .unwrap();
        assert_eq!(store.get_candidate(&id).unwrap().unwrap().status, "rejected");

        // One more sighting is not enough (score stays below 0.86).
        let mut again = extracted("The user uses Rust daily for systems work.", "c2");
        again.confidence = 0.95;
        candidates
            .upsert_candidates(
                vec![again],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();
        assert_eq!(store.get_candidate(&id).unwrap().unwrap().status, "rejected");

        // A third conversation pushes the score past 0.86 with evidence >= 2
        // and the candidate returns to pending.
        let mut third = extracted("The user uses Rust daily for systems work.", "c3");
        third.confidence = 0.95;
        candidates
            .upsert_candidates(
                vec![third],
                "heuristic",
                "conversation-analyzer:heuristic",
                0.92,
            )
            .await
            .unwrap();
        let row = store.get_candidate(&id).unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.promotion_score >= 0.86);
    }

    #[test]
    fn promotion_score_formula() {
        let now = Utc::now();
        // Max-ish inputs: 0.99*0.52 + 0.23 + 0.17 + 0.08 + 0.04 = 0.9948,
        // clamped to 0.99.
        let score = promotion_score(0.99, 4, 3, MemoryLevel::Semantic, now, now);
        assert!((score - 0.99).abs() < 1e-9);

        // Evidence saturates at 4.
        let four = promotion_score(0.8, 4, 1, MemoryLevel::Semantic, now, now);
        let eight = promotion_score(0.8, 8, 1, MemoryLevel::Semantic, now, now);
        assert!((four - eight).abs() < 1e-9);

        // Recency decays over 60 days.
        let stale = promotion_score(
            0.8,
            1,
            1,
            MemoryLevel::Semantic,
            now - chrono::Duration::days(90),
            now,
        );
        let fresh = promotion_score(0.8, 1, 1, MemoryLevel::Semantic, now, now);
        assert!(fresh > stale);
        assert!((fresh - stale - 0.08).abs() < 1e-6);
    }

    #[test]
    fn promotable_selection_escape_hatch() {
        let now = Utc::now();
        let mut row = MiningCandidateRecord {
            id: "c1".into(),
            canonical_key: "k".into(),
            content: "The user uses Rust daily for systems work.".into(),
            normalized_content: "the user uses rust daily".into(),
            category: MemoryCategory::Skills,
            level: MemoryLevel::Semantic,
            confidence_score: 0.95,
            source_provider: "heuristic".into(),
            source_llm: "conversation-analyzer:heuristic".into(),
            evidence_count: 1,
            conversation_ids: vec!["c1".into()],
            source_message_ids: vec![],
            methods: vec!["heuristic".into()],
            first_seen_at: now,
            last_seen_at: now,
            promotion_score: promotion_score(0.95, 1, 1, MemoryLevel::Semantic, now, now),
            status: "pending".into(),
            promoted_memory_id: None,
            last_result: String::new(),
            last_error: String::new(),
            created_at: now,
            updated_at: now,
            embedding: Embedding::zero(),
        };

        // Clears the standard gate at the default 0.72 threshold.
        assert!(is_promotable(&row, 0.72, 1, 1));

        // Below the direct gate (raised threshold) but confidence >= 0.93
        // takes the escape hatch.
        assert!(is_promotable(&row, row.promotion_score + 0.01, 1, 1));

        // A non-pending row never promotes.
        row.status = "promoted".into();
        assert!(!is_promotable(&row, 0.5, 1, 1));
    }
}
