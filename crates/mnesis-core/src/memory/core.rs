//! Memory Core
//!
//! The lifecycle owner for the memories table: validation, embedding,
//! exact + semantic dedup, conflict staging, versioning, soft delete,
//! retrieval scoring, snapshots, and feedback. Every mutation is submitted
//! through the write queue; validation failures are returned as error
//! outcomes before anything is enqueued.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::decay::infer_decay;
use super::sessions::SessionTracker;
use super::write_queue::WriteQueue;
use super::{ConflictStatus, MemoryCategory, MemoryEventKind, MemoryLevel, MemoryStatus, Privacy};
use crate::embeddings::{count_tokens, Embedding, EmbeddingService};
use crate::graph::{GraphLayer, GraphNeighbor};
use crate::storage::{
    MemoryEventRecord, MemoryRecord, MemoryVersionRecord, PendingConflictRecord, Result, Store,
};

/// Exact-dedup and semantic-dedup neighbor window.
const DEDUP_NEIGHBORS: usize = 10;

/// Cosine similarity above which a new memory merges into its neighbor.
const SEMANTIC_MERGE_THRESHOLD: f32 = 0.92;

/// Similarity band that stages a pending conflict.
const CONFLICT_BAND_LOW: f32 = 0.75;
const CONFLICT_BAND_HIGH: f32 = 0.92;

/// Snapshot token budget.
const SNAPSHOT_TOKEN_BUDGET: usize = 800;

// ============================================================================
// OUTCOME / PARAMS
// ============================================================================

/// Shape of every write-path result: `{status, action, message?}` values,
/// never raised errors for domain outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub id: Option<String>,
    pub status: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl WriteOutcome {
    fn rejected(action: &str, message: String) -> Self {
        Self {
            id: None,
            status: "error".into(),
            action: action.into(),
            message: Some(message),
            version: None,
        }
    }

    fn of(id: &str, status: &str, action: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            status: status.into(),
            action: action.into(),
            message: None,
            version: None,
        }
    }

    /// True when the outcome represents a row write (created / merged /
    /// updated, with or without conflicts).
    pub fn wrote_row(&self) -> bool {
        matches!(
            self.action.as_str(),
            "created" | "created_with_conflict" | "merged" | "updated"
        )
    }
}

/// Inputs for `create_memory`.
#[derive(Debug, Clone)]
pub struct CreateMemoryParams {
    pub content: String,
    pub category: MemoryCategory,
    pub level: MemoryLevel,
    pub source_llm: String,
    pub importance_score: f64,
    pub confidence_score: f64,
    pub privacy: Privacy,
    pub tags: Vec<String>,
    pub source_conversation_id: Option<String>,
    pub source_message_id: Option<String>,
    pub source_excerpt: Option<String>,
    pub suggestion_reason: Option<String>,
    pub forced_status: Option<MemoryStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
}

impl CreateMemoryParams {
    pub fn new(content: &str, category: &str, level: &str, source_llm: &str) -> Self {
        Self {
            content: content.to_string(),
            category: MemoryCategory::parse_name(category),
            level: MemoryLevel::parse_name(level),
            source_llm: source_llm.to_string(),
            importance_score: 0.5,
            confidence_score: 0.7,
            privacy: Privacy::Public,
            tags: vec![],
            source_conversation_id: None,
            source_message_id: None,
            source_excerpt: None,
            suggestion_reason: None,
            forced_status: None,
            created_at: None,
            session_id: None,
        }
    }
}

/// A scored retrieval hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f64,
    pub memory: MemoryRecord,
}

// ============================================================================
// MEMORY CORE
// ============================================================================

/// The single owner of writes to the memories table.
pub struct MemoryCore {
    store: Arc<Store>,
    embedder: Arc<EmbeddingService>,
    queue: WriteQueue,
    graph: Arc<GraphLayer>,
    sessions: SessionTracker,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl MemoryCore {
    pub fn new(store: Arc<Store>, embedder: Arc<EmbeddingService>, queue: WriteQueue) -> Self {
        let sessions = SessionTracker::new(store.clone());
        Self {
            store,
            embedder,
            queue,
            graph: Arc::new(GraphLayer::new()),
            sessions,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("100 is non-zero"),
            )),
        }
    }

    pub fn with_graph(mut self, graph: Arc<GraphLayer>) -> Self {
        self.graph = graph;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn embedder(&self) -> &Arc<EmbeddingService> {
        &self.embedder
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.queue
    }

    // ========================================================================
    // CREATE
    // ========================================================================

    /// Create a memory with exact + semantic dedup and conflict staging.
    pub async fn create_memory(&self, params: CreateMemoryParams) -> Result<WriteOutcome> {
        let content = params.content.trim().to_string();

        // --- Validation (hard reject, before enqueue) ---
        let char_count = content.chars().count();
        if char_count < 20 {
            return Ok(WriteOutcome::rejected(
                "rejected_length",
                format!("Content too short ({char_count} chars). Minimum is 20."),
            ));
        }
        if char_count > 1000 {
            return Ok(WriteOutcome::rejected(
                "rejected_length",
                format!(
                    "Content too long ({char_count} chars). Maximum is 1000. \
                     Split into multiple memories."
                ),
            ));
        }
        let token_count = count_tokens(&content);
        if token_count > 128 {
            return Ok(WriteOutcome::rejected(
                "rejected_tokens",
                format!("Content exceeds 128 tokens ({token_count}). Split into multiple memories."),
            ));
        }
        if is_first_person(&content) {
            return Ok(WriteOutcome::rejected(
                "rejected_first_person",
                "Write memories in third-person declarative format \
                 (e.g. 'The user prefers...')."
                    .to_string(),
            ));
        }

        // --- Initial status ---
        let mut status = MemoryStatus::Active;
        if params.level == MemoryLevel::Semantic && params.confidence_score < 0.85 {
            status = MemoryStatus::PendingReview;
        }
        if let Some(forced) = params.forced_status {
            status = forced;
        }

        let embedder = self.embedder.clone();
        let graph = self.graph.clone();
        let session_id = params.session_id.clone();

        let outcome = self
            .queue
            .enqueue(move |store| {
                create_memory_op(store, &embedder, &graph, &params, &content, status)
            })
            .await?;

        if let (Some(session_id), Some(memory_id)) = (session_id, outcome.id.clone()) {
            if outcome.wrote_row() {
                if let Err(e) =
                    self.sessions
                        .update_activity(&session_id, &[], &[memory_id], &[])
                {
                    tracing::warn!("Failed to update session activity: {}", e);
                }
            }
        }

        Ok(outcome)
    }

    // ========================================================================
    // UPDATE
    // ========================================================================

    /// Update a memory's content: archives the prior content as a
    /// MemoryVersion, re-embeds, bumps the version, raises importance to at
    /// least 0.6.
    pub async fn update_memory(
        &self,
        memory_id: &str,
        content: &str,
        source_llm: &str,
        session_id: Option<&str>,
    ) -> Result<WriteOutcome> {
        let memory_id = memory_id.to_string();
        let content = content.to_string();
        let source_llm = source_llm.to_string();
        let embedder = self.embedder.clone();

        let outcome = self
            .queue
            .enqueue(move |store| {
                let Some(current) = store.get_memory(&memory_id)? else {
                    return Ok(WriteOutcome {
                        id: Some(memory_id.clone()),
                        status: "error".into(),
                        action: "not_found".into(),
                        message: Some(format!("Memory {memory_id} not found")),
                        version: None,
                    });
                };

                let now = Utc::now();
                store.insert_version(&MemoryVersionRecord {
                    id: Uuid::new_v4().to_string(),
                    memory_id: memory_id.clone(),
                    content: current.content.clone(),
                    version: current.version,
                    changed_by: source_llm.clone(),
                    created_at: current.updated_at,
                })?;

                let embedding = embed_or_zero(&embedder, &content);
                let new_version = current.version + 1;
                let importance = current.importance_score.max(0.6);
                store.update_memory_content(
                    &memory_id,
                    &content,
                    &embedding,
                    new_version,
                    importance,
                    now,
                )?;

                append_event(store, &memory_id, MemoryEventKind::Updated, &source_llm, "");

                Ok(WriteOutcome {
                    id: Some(memory_id.clone()),
                    status: current.status.as_str().into(),
                    action: "updated".into(),
                    message: None,
                    version: Some(new_version),
                })
            })
            .await?;

        if let Some(session_id) = session_id {
            if outcome.wrote_row() {
                let id = outcome.id.clone().unwrap_or_default();
                if let Err(e) = self.sessions.update_activity(session_id, &[], &[id], &[]) {
                    tracing::warn!("Failed to update session activity: {}", e);
                }
            }
        }

        Ok(outcome)
    }

    // ========================================================================
    // DELETE / RESTORE
    // ========================================================================

    /// Soft delete: `status = archived`, cascade-delete the memory's graph
    /// edges (as source or target). Idempotent. MemoryVersions are kept.
    pub async fn delete_memory(&self, memory_id: &str) -> Result<WriteOutcome> {
        let memory_id = memory_id.to_string();
        self.queue
            .enqueue(move |store| {
                let previous = store.get_memory(&memory_id)?;
                store.set_memory_status(&memory_id, MemoryStatus::Archived, Utc::now())?;
                let deleted_edges = store.delete_edges_for_memory(&memory_id)?;
                if deleted_edges > 0 {
                    tracing::info!(
                        "Deleted {} graph edge(s) for memory {}",
                        deleted_edges,
                        memory_id
                    );
                }
                if previous.is_some_and(|m| m.status != MemoryStatus::Archived) {
                    append_event(store, &memory_id, MemoryEventKind::Archived, "", "");
                }
                Ok(WriteOutcome::of(&memory_id, "archived", "deleted"))
            })
            .await
    }

    /// Explicit restore — the only archived -> active transition.
    pub async fn restore_memory(&self, memory_id: &str) -> Result<WriteOutcome> {
        let memory_id = memory_id.to_string();
        self.queue
            .enqueue(move |store| {
                let Some(current) = store.get_memory(&memory_id)? else {
                    return Ok(WriteOutcome {
                        id: Some(memory_id.clone()),
                        status: "error".into(),
                        action: "not_found".into(),
                        message: Some(format!("Memory {memory_id} not found")),
                        version: None,
                    });
                };
                if current.status == MemoryStatus::Archived {
                    store.set_memory_status(&memory_id, MemoryStatus::Active, Utc::now())?;
                    append_event(store, &memory_id, MemoryEventKind::Restored, "", "");
                }
                Ok(WriteOutcome::of(&memory_id, "active", "restored"))
            })
            .await
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Retrieve active memories for a query, re-ranked by
    /// `0.5·similarity + 0.3·importance + 0.2·recency`, with a ×1.3 boost
    /// when a context tag matches. Touches reference counts best-effort.
    pub async fn search_memories(
        &self,
        query: &str,
        limit: usize,
        context: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(vec![]);
        }

        let query_vector = self.query_embedding(query);
        let now = Utc::now();
        let neighbors =
            self.store
                .nearest_memories(&query_vector, limit * 3, Some(MemoryStatus::Active))?;

        let mut hits: Vec<SearchHit> = neighbors
            .into_iter()
            .map(|(memory, distance)| {
                let similarity = f64::from((1.0 - distance).max(0.0));
                let days_since = (now - memory.last_referenced_at).num_seconds() as f64 / 86_400.0;
                let recency = (-0.05 * days_since.max(0.0)).exp();
                let mut score =
                    0.5 * similarity + 0.3 * memory.importance_score + 0.2 * recency;
                if let Some(context) = context {
                    let context = context.to_lowercase();
                    if memory.tags.iter().any(|t| t.to_lowercase() == context) {
                        score *= 1.3;
                    }
                }
                SearchHit { score, memory }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        // Reference bookkeeping is best-effort; a failed touch never fails
        // the read.
        for hit in &hits {
            if let Err(e) = self.store.touch_memory_reference(&hit.memory.id, now) {
                tracing::warn!("Failed to touch memory {}: {}", hit.memory.id, e);
            }
        }

        if let Some(session_id) = session_id {
            let read_ids: Vec<String> = hits.iter().map(|h| h.memory.id.clone()).collect();
            if !read_ids.is_empty() {
                if let Err(e) = self.sessions.update_activity(session_id, &read_ids, &[], &[]) {
                    tracing::warn!("Failed to update session read activity: {}", e);
                }
            }
        }

        Ok(hits)
    }

    fn query_embedding(&self, query: &str) -> Vec<f32> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(cached) = cache.get(query) {
                return cached.clone();
            }
        }
        let vector = embed_or_zero(&self.embedder, query).vector;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), vector.clone());
        }
        vector
    }

    // ========================================================================
    // SNAPSHOT
    // ========================================================================

    /// Markdown snapshot of active semantic memories grouped by section,
    /// ordered per context, capped at 800 tokens. Over-budget snapshots drop
    /// sections in reverse priority (skills first, identity never).
    pub async fn get_snapshot(&self, context: Option<&str>) -> Result<String> {
        let now = Utc::now();
        let section_order: [&str; 5] = match context {
            Some("development") => ["identity", "projects", "skills", "preferences", "relationships"],
            Some("business") => ["identity", "projects", "preferences", "relationships", "skills"],
            Some("personal") => ["identity", "relationships", "preferences", "projects", "skills"],
            Some("creative") => ["identity", "preferences", "projects", "skills", "relationships"],
            _ => ["identity", "preferences", "projects", "relationships", "skills"],
        };

        let mut sections: Vec<(String, String)> = Vec::new();
        for key in section_order {
            let (category, header, cap) = match key {
                "identity" => (MemoryCategory::Identity, "## Identity", 3),
                "preferences" => (
                    MemoryCategory::Preferences,
                    "## Preferences & Working Style",
                    5,
                ),
                "projects" => (MemoryCategory::Projects, "## Active Projects", 10),
                "relationships" => (MemoryCategory::Relationships, "## Key Relationships", 5),
                _ => (MemoryCategory::Skills, "## Skills & Expertise", 5),
            };
            let items = self.store.list_memories(
                Some(category),
                Some(MemoryLevel::Semantic),
                MemoryStatus::Active,
                cap,
                0,
            )?;
            if items.is_empty() {
                continue;
            }
            let lines: Vec<String> = items.iter().map(|m| format!("- {}", m.content)).collect();
            sections.push((key.to_string(), format!("{header}\n{}", lines.join("\n"))));
        }

        // Recent working context, newest first.
        let mut working = self.store.list_memories(
            None,
            Some(MemoryLevel::Working),
            MemoryStatus::Active,
            100,
            0,
        )?;
        working.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if !working.is_empty() {
            let lines: Vec<String> = working
                .iter()
                .take(10)
                .map(|m| format!("- {}", m.content))
                .collect();
            sections.push((
                "recent".to_string(),
                format!("## Recent Context (last 72h)\n{}", lines.join("\n")),
            ));
        }

        let header = format!("# Memory Context — {}", now.to_rfc3339());
        let render = |sections: &[(String, String)]| {
            let mut parts = vec![header.clone()];
            parts.extend(sections.iter().map(|(_, body)| body.clone()));
            parts.join("\n\n")
        };

        // Enforce the token budget by dropping sections in reverse priority.
        let drop_order = ["skills", "relationships", "preferences", "projects", "recent"];
        let mut result = render(&sections);
        let mut drop_idx = 0;
        while count_tokens(&result) > SNAPSHOT_TOKEN_BUDGET && drop_idx < drop_order.len() {
            sections.retain(|(key, _)| key != drop_order[drop_idx]);
            drop_idx += 1;
            result = render(&sections);
        }

        Ok(result)
    }

    // ========================================================================
    // FEEDBACK
    // ========================================================================

    /// Raise importance for memories the client actually used. Score-only
    /// update, deliberately outside the write queue; the session is closed
    /// with reason `feedback_called`.
    pub async fn process_feedback(
        &self,
        used_memory_ids: &[String],
        session_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        if let Some(session_id) = session_id {
            if let Err(e) =
                self.sessions
                    .update_activity(session_id, &[], &[], used_memory_ids)
            {
                tracing::warn!("Session feedback update failed: {}", e);
            }
            if let Err(e) = self.sessions.end_session(session_id, "feedback_called") {
                tracing::warn!("Session end failed: {}", e);
            }
        }

        let now = Utc::now();
        let mut updated_count = 0usize;
        for memory_id in used_memory_ids {
            match self.store.get_memory(memory_id) {
                Ok(Some(memory)) => {
                    let new_score = (memory.importance_score + 0.05).min(1.0);
                    if let Err(e) = self.store.apply_feedback(memory_id, new_score, now) {
                        tracing::error!("Failed to update feedback for {}: {}", memory_id, e);
                        continue;
                    }
                    updated_count += 1;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Failed to load memory {}: {}", memory_id, e);
                }
            }
        }

        Ok(serde_json::json!({
            "status": "success",
            "updated_count": updated_count,
            "message": "Feedback processed",
        }))
    }

    // ========================================================================
    // LISTING / LOOKUP
    // ========================================================================

    pub fn get_memory(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        self.store.get_memory(memory_id)
    }

    /// Paged projections sorted by importance desc, content previews only.
    pub fn list_memories(
        &self,
        category: Option<&str>,
        level: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let rows = self.store.list_memories(
            category.map(MemoryCategory::parse_name),
            level.map(MemoryLevel::parse_name),
            MemoryStatus::Active,
            limit,
            offset,
        )?;
        Ok(rows.iter().map(|m| m.list_projection()).collect())
    }
}

// ============================================================================
// WRITE OP (runs on the write worker)
// ============================================================================

fn create_memory_op(
    store: &Store,
    embedder: &EmbeddingService,
    graph: &GraphLayer,
    params: &CreateMemoryParams,
    content: &str,
    status: MemoryStatus,
) -> Result<WriteOutcome> {
    let now = Utc::now();
    let embedding = embed_or_zero(embedder, content);
    let content_hash = sha256_lower(content);

    // Embedding-less writes (embedder still warming) skip dedup, conflict
    // detection, and edges; the row still lands.
    let neighbors = if embedding.is_zero() {
        vec![]
    } else {
        store.nearest_memories(&embedding.vector, DEDUP_NEIGHBORS, Some(MemoryStatus::Active))?
    };

    // --- Exact dedup: SHA-256 over lowercased content ---
    for (neighbor, _) in &neighbors {
        if sha256_lower(neighbor.content.trim()) == content_hash {
            tracing::info!("Exact duplicate found: {}", neighbor.id);
            return Ok(WriteOutcome::of(
                &neighbor.id,
                neighbor.status.as_str(),
                "skipped",
            ));
        }
    }

    // --- Semantic dedup & conflict staging ---
    let mut action = "created";
    let mut staged_conflicts: Vec<PendingConflictRecord> = Vec::new();

    for (neighbor, distance) in &neighbors {
        let score = 1.0 - distance;

        if score > SEMANTIC_MERGE_THRESHOLD {
            tracing::info!(
                "Semantic duplicate found (score {:.3}): {}",
                score,
                neighbor.id
            );
            let new_importance = neighbor.importance_score.max(params.importance_score);
            store.merge_memory_importance(&neighbor.id, new_importance, now)?;
            append_event(
                store,
                &neighbor.id,
                MemoryEventKind::Merged,
                &params.source_llm,
                "",
            );
            return Ok(WriteOutcome::of(
                &neighbor.id,
                neighbor.status.as_str(),
                "merged",
            ));
        }

        if (CONFLICT_BAND_LOW..=CONFLICT_BAND_HIGH).contains(&score) {
            // The new id is unknown until after insert; stage with a
            // placeholder and patch once the insert succeeds, so a failed
            // insert cannot leave orphan conflict rows.
            staged_conflicts.push(PendingConflictRecord {
                id: Uuid::new_v4().to_string(),
                memory_id_a: neighbor.id.clone(),
                memory_id_b: "PENDING".to_string(),
                similarity_score: f64::from(score),
                detected_at: now,
                resolved_at: None,
                resolution: None,
                resolved_by: None,
                status: ConflictStatus::Pending,
            });
            action = "created_with_conflict";
        }
    }

    // --- Create the new memory ---
    let memory_id = Uuid::new_v4().to_string();
    let created_at = params.created_at.unwrap_or(now);
    let decay = infer_decay(content, params.category, params.level, now);

    let record = MemoryRecord {
        id: memory_id.clone(),
        content: content.to_string(),
        level: params.level,
        category: params.category,
        importance_score: params.importance_score,
        confidence_score: params.confidence_score,
        privacy: params.privacy,
        tags: params.tags.clone(),
        source_llm: params.source_llm.clone(),
        source_conversation_id: params.source_conversation_id.clone(),
        version: 1,
        status,
        created_at,
        updated_at: now,
        last_referenced_at: now,
        reference_count: 0,
        decay_profile: decay.decay_profile,
        expires_at: decay.expires_at,
        needs_review: decay.needs_review,
        review_due_at: decay.review_due_at,
        event_date: decay.event_date,
        source_message_id: params.source_message_id.clone(),
        source_excerpt: params.source_excerpt.clone(),
        suggestion_reason: params.suggestion_reason.clone(),
        review_note: None,
        embedding,
    };
    store.insert_memory(&record)?;
    append_event(store, &memory_id, MemoryEventKind::Created, &params.source_llm, "");

    if !staged_conflicts.is_empty() {
        for conflict in &mut staged_conflicts {
            conflict.memory_id_b = memory_id.clone();
        }
        store.insert_conflicts(&staged_conflicts)?;
        for conflict in &staged_conflicts {
            append_event(
                store,
                &memory_id,
                MemoryEventKind::ConflictOpened,
                &params.source_llm,
                &conflict.memory_id_a,
            );
        }
    }

    // Graph edges are best-effort; failure never blocks the write.
    let graph_neighbors: Vec<GraphNeighbor> = neighbors
        .iter()
        .map(|(n, d)| GraphNeighbor::from_record(n, *d))
        .collect();
    let edges = graph.derive_edges(&record, &graph_neighbors, now);
    if !edges.is_empty() {
        if let Err(e) = graph.persist_edges(store, &edges) {
            tracing::warn!("Failed to persist graph edges for {}: {}", memory_id, e);
        }
    }

    Ok(WriteOutcome::of(&memory_id, status.as_str(), action))
}

// ============================================================================
// HELPERS
// ============================================================================

fn sha256_lower(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn embed_or_zero(embedder: &EmbeddingService, text: &str) -> Embedding {
    match embedder.embed(text) {
        Ok(embedding) => embedding,
        Err(e) => {
            tracing::warn!("Embedding unavailable, writing zero vector: {}", e);
            Embedding::zero()
        }
    }
}

fn is_first_person(content: &str) -> bool {
    let padded = format!(" {content} ");
    let lowered = content.to_lowercase();
    padded.contains(" I ")
        || content.starts_with("I ")
        || lowered.starts_with("i'm ")
        || lowered.starts_with("i am ")
}

fn append_event(store: &Store, memory_id: &str, kind: MemoryEventKind, actor: &str, detail: &str) {
    let event = MemoryEventRecord {
        id: Uuid::new_v4().to_string(),
        memory_id: memory_id.to_string(),
        kind,
        detail: detail.to_string(),
        actor: actor.to_string(),
        created_at: Utc::now(),
    };
    if let Err(e) = store.append_event(&event) {
        tracing::warn!("Failed to append memory event: {}", e);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, MemoryCore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("core.db"))).unwrap());
        let embedder = Arc::new(EmbeddingService::hashed());
        let queue = WriteQueue::start(store.clone());
        (dir, MemoryCore::new(store, embedder, queue))
    }

    fn params(content: &str) -> CreateMemoryParams {
        let mut p = CreateMemoryParams::new(content, "preferences", "semantic", "claude");
        p.confidence_score = 0.9;
        p
    }

    #[tokio::test]
    async fn length_boundaries() {
        let (_dir, core) = setup();

        // Exactly 20 chars accepted, 19 rejected.
        let twenty = "a".repeat(20);
        let ok = core.create_memory(params(&twenty)).await.unwrap();
        assert_eq!(ok.action, "created");

        let nineteen = "b".repeat(19);
        let rejected = core.create_memory(params(&nineteen)).await.unwrap();
        assert_eq!(rejected.action, "rejected_length");
        assert_eq!(rejected.status, "error");

        // Exactly 1000 chars (112 short words) accepted.
        let mut words: Vec<String> = (0..111).map(|i| format!("ab{:02}cdef", i % 100)).collect();
        words.push("z".to_string());
        let thousand = words.join(" ");
        assert_eq!(thousand.chars().count(), 1000);
        let ok_long = core.create_memory(params(&thousand)).await.unwrap();
        assert_eq!(ok_long.action, "created");

        // One char over is rejected on length before the token check.
        let over = "d".repeat(1001);
        let rejected_long = core.create_memory(params(&over)).await.unwrap();
        assert_eq!(rejected_long.action, "rejected_length");

        // A single 1000-char word passes length but exceeds the 128-token
        // budget.
        let one_word = "c".repeat(1000);
        let too_many_tokens = core.create_memory(params(&one_word)).await.unwrap();
        assert_eq!(too_many_tokens.action, "rejected_tokens");
    }

    #[tokio::test]
    async fn token_boundary() {
        let (_dir, core) = setup();

        // 128 four-char words = 128 tokens, accepted.
        let words: Vec<String> = (0..128).map(|i| format!("w{:03}", i % 1000)).collect();
        let ok = core.create_memory(params(&words.join(" "))).await.unwrap();
        assert_eq!(ok.action, "created");

        // 129 words = 129 tokens, rejected.
        let words: Vec<String> = (0..129).map(|i| format!("x{:03}", i % 1000)).collect();
        let rejected = core.create_memory(params(&words.join(" "))).await.unwrap();
        assert_eq!(rejected.action, "rejected_tokens");
    }

    #[tokio::test]
    async fn first_person_rejected_third_person_accepted() {
        let (_dir, core) = setup();

        let rejected = core
            .create_memory(params("I am happy about the new project."))
            .await
            .unwrap();
        assert_eq!(rejected.action, "rejected_first_person");

        let ok = core
            .create_memory(params("The user is happy about the new project."))
            .await
            .unwrap();
        assert_eq!(ok.action, "created");
    }

    #[tokio::test]
    async fn pending_review_gate() {
        let (_dir, core) = setup();

        let mut low = CreateMemoryParams::new(
            "The user enjoys long-distance trail running.",
            "preferences",
            "semantic",
            "claude",
        );
        low.confidence_score = 0.70;
        let outcome = core.create_memory(low).await.unwrap();
        assert_eq!(outcome.status, "pending_review");

        let mut high = CreateMemoryParams::new(
            "The user enjoys alpine climbing in winter.",
            "preferences",
            "semantic",
            "claude",
        );
        high.confidence_score = 0.90;
        let outcome = core.create_memory(high).await.unwrap();
        assert_eq!(outcome.status, "active");
    }

    #[tokio::test]
    async fn exact_dedup_skips_identical_content() {
        let (_dir, core) = setup();
        let content = "The user prefers concise technical answers with direct action items.";

        let first = core.create_memory(params(content)).await.unwrap();
        assert_eq!(first.action, "created");

        let second = core.create_memory(params(content)).await.unwrap();
        assert_eq!(second.action, "skipped");
        assert_eq!(second.id, first.id);
        assert_eq!(core.store().count_memories(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn semantic_merge_raises_importance() {
        let (_dir, core) = setup();

        let mut first = params("The user prefers concise technical answers.");
        first.importance_score = 0.4;
        let created = core.create_memory(first).await.unwrap();
        assert_eq!(created.action, "created");

        // Near-identical content (similarity > 0.92 under the hashed
        // backend) merges into the existing row.
        let mut second = params("The user prefers concise technical answers!");
        second.importance_score = 0.8;
        let merged = core.create_memory(second).await.unwrap();
        assert_eq!(merged.action, "merged");
        assert_eq!(merged.id, created.id);

        let existing = core.get_memory(&created.id.unwrap()).unwrap().unwrap();
        assert_eq!(existing.importance_score, 0.8);
        assert_eq!(core.store().count_memories(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn conflict_band_stages_pending_conflict() {
        let (_dir, core) = setup();

        let first = core
            .create_memory(params("Julien prefers Python for backend services."))
            .await
            .unwrap();
        assert_eq!(first.action, "created");

        let second = core
            .create_memory(params("Julien does not prefer Python for backend services."))
            .await
            .unwrap();
        assert_eq!(second.action, "created_with_conflict");
        assert_ne!(second.id, first.id);

        let conflicts = core.store().pending_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].memory_id_a, first.id.clone().unwrap());
        assert_eq!(conflicts[0].memory_id_b, second.id.clone().unwrap());
        assert_eq!(conflicts[0].status, ConflictStatus::Pending);
        assert!(conflicts[0].memory_id_b != "PENDING");
    }

    #[tokio::test]
    async fn update_builds_gap_free_version_chain() {
        let (_dir, core) = setup();

        let created = core
            .create_memory(params("The user works from home on Fridays usually."))
            .await
            .unwrap();
        let id = created.id.unwrap();

        let updated = core
            .update_memory(&id, "The user works from home on Thursdays usually.", "claude", None)
            .await
            .unwrap();
        assert_eq!(updated.version, Some(2));

        let again = core
            .update_memory(&id, "The user works from home on Thursdays usually.", "claude", None)
            .await
            .unwrap();
        assert_eq!(again.version, Some(3));

        // v = 3 -> exactly 2 version rows, ascending 1..=2.
        let versions = core.store().versions_for(&id).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 1);
        assert_eq!(versions[1].version, 2);

        let current = core.get_memory(&id).unwrap().unwrap();
        assert_eq!(current.version, 3);
        assert!(current.importance_score >= 0.6);
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent_and_cascades_edges() {
        let (_dir, core) = setup();

        let a = core
            .create_memory(params("The user works from home on Fridays usually."))
            .await
            .unwrap()
            .id
            .unwrap();
        // A same-category neighbor in the similarity band produces at least
        // one BELONGS_TO edge pointing at the first memory.
        core.create_memory(params("The user works from home on Thursdays usually."))
            .await
            .unwrap();
        assert!(!core.store().all_edges(100).unwrap().is_empty());

        let first = core.delete_memory(&a).await.unwrap();
        assert_eq!(first.status, "archived");
        let second = core.delete_memory(&a).await.unwrap();
        assert_eq!(second.status, "archived");

        let archived = core.get_memory(&a).unwrap().unwrap();
        assert_eq!(archived.status, MemoryStatus::Archived);

        // No edge still references the archived id.
        let edges = core.store().all_edges(1000).unwrap();
        assert!(edges
            .iter()
            .all(|e| e.source_memory_id != a && e.target_memory_id != a));
    }

    #[tokio::test]
    async fn restore_is_the_only_way_back() {
        let (_dir, core) = setup();
        let id = core
            .create_memory(params("The user archives old notebooks every quarter."))
            .await
            .unwrap()
            .id
            .unwrap();

        core.delete_memory(&id).await.unwrap();
        assert_eq!(
            core.get_memory(&id).unwrap().unwrap().status,
            MemoryStatus::Archived
        );

        core.restore_memory(&id).await.unwrap();
        assert_eq!(
            core.get_memory(&id).unwrap().unwrap().status,
            MemoryStatus::Active
        );
    }

    #[tokio::test]
    async fn feedback_is_monotonic_and_clamped() {
        let (_dir, core) = setup();
        let id = core
            .create_memory(params("The user reviews pull requests before lunch."))
            .await
            .unwrap()
            .id
            .unwrap();

        let before = core.get_memory(&id).unwrap().unwrap();
        let result = core.process_feedback(&[id.clone()], None).await.unwrap();
        assert_eq!(result["updated_count"], 1);

        let after = core.get_memory(&id).unwrap().unwrap();
        assert!(after.importance_score > before.importance_score);
        assert_eq!(after.reference_count, before.reference_count + 1);

        // Repeated feedback never exceeds 1.0.
        for _ in 0..30 {
            core.process_feedback(&[id.clone()], None).await.unwrap();
        }
        let capped = core.get_memory(&id).unwrap().unwrap();
        assert!(capped.importance_score <= 1.0);
    }

    #[tokio::test]
    async fn search_limit_zero_returns_empty() {
        let (_dir, core) = setup();
        core.create_memory(params("The user prefers green tea over coffee."))
            .await
            .unwrap();
        let hits = core
            .search_memories("green tea", 0, None, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_returns_all_when_limit_exceeds_count() {
        let (_dir, core) = setup();
        core.create_memory(params("The user prefers green tea over coffee."))
            .await
            .unwrap();
        core.create_memory(params("The user hikes in the mountains every October."))
            .await
            .unwrap();

        let hits = core
            .search_memories("tea preferences of the user", 50, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        // The tea memory ranks first.
        assert!(hits[0].memory.content.contains("green tea"));
    }

    #[tokio::test]
    async fn search_context_boost_reorders() {
        let (_dir, core) = setup();
        let mut tagged = params("The user deploys services with containers weekly.");
        tagged.tags = vec!["development".to_string()];
        core.create_memory(tagged).await.unwrap();
        core.create_memory(params("The user deploys services with containers daily."))
            .await
            .unwrap();

        let hits = core
            .search_memories("container deployments", 2, Some("development"), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].memory.tags.contains(&"development".to_string()));
    }

    #[tokio::test]
    async fn search_touches_reference_counts() {
        let (_dir, core) = setup();
        let id = core
            .create_memory(params("The user prefers green tea over coffee."))
            .await
            .unwrap()
            .id
            .unwrap();

        core.search_memories("green tea", 5, None, None).await.unwrap();
        let after = core.get_memory(&id).unwrap().unwrap();
        assert_eq!(after.reference_count, 1);
    }

    #[tokio::test]
    async fn snapshot_sections_and_context_rotation() {
        let (_dir, core) = setup();
        let mut identity = CreateMemoryParams::new(
            "The user's name is Julien.",
            "identity",
            "semantic",
            "claude",
        );
        identity.confidence_score = 0.95;
        core.create_memory(identity).await.unwrap();

        let mut project = CreateMemoryParams::new(
            "The user is building the HomeBoard dashboard.",
            "projects",
            "semantic",
            "claude",
        );
        project.confidence_score = 0.95;
        core.create_memory(project).await.unwrap();

        let snapshot = core.get_snapshot(Some("development")).await.unwrap();
        assert!(snapshot.contains("## Identity"));
        assert!(snapshot.contains("## Active Projects"));
        let identity_pos = snapshot.find("## Identity").unwrap();
        let project_pos = snapshot.find("## Active Projects").unwrap();
        assert!(identity_pos < project_pos);
        assert!(count_tokens(&snapshot) <= SNAPSHOT_TOKEN_BUDGET);
    }

    #[tokio::test]
    async fn concurrent_identical_creates_yield_one_row() {
        let (_dir, core) = setup();
        let core = Arc::new(core);
        let content = "The user prefers concise technical answers with direct action items.";

        let mut joins = Vec::new();
        for _ in 0..8 {
            let core = core.clone();
            joins.push(tokio::spawn(async move {
                core.create_memory(params(content)).await.unwrap()
            }));
        }
        let outcomes: Vec<WriteOutcome> =
            futures_join_all(joins).await.into_iter().collect();

        let created: Vec<_> = outcomes.iter().filter(|o| o.action == "created").collect();
        assert_eq!(created.len(), 1);
        let winner = created[0].id.clone().unwrap();
        for outcome in &outcomes {
            if outcome.action != "created" {
                assert!(matches!(outcome.action.as_str(), "skipped" | "merged"));
                assert_eq!(outcome.id.clone().unwrap(), winner);
            }
        }
        assert_eq!(
            core.store().count_memories(Some(MemoryStatus::Active)).unwrap(),
            1
        );
    }

    async fn futures_join_all(
        joins: Vec<tokio::task::JoinHandle<WriteOutcome>>,
    ) -> Vec<WriteOutcome> {
        let mut out = Vec::new();
        for join in joins {
            out.push(join.await.unwrap());
        }
        out
    }
}
