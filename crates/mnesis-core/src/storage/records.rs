//! Row types for every Mnesis table.
//!
//! These are the on-disk shapes. Client-facing projections (vector stripped,
//! content previews) are produced by the lifecycle layer, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embeddings::Embedding;
use crate::memory::{
    ConflictStatus, DecayProfile, MemoryCategory, MemoryEventKind, MemoryLevel, MemoryStatus,
    Privacy,
};

// ============================================================================
// MEMORY
// ============================================================================

/// A memory row — the central entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub level: MemoryLevel,
    pub category: MemoryCategory,
    pub importance_score: f64,
    pub confidence_score: f64,
    pub privacy: Privacy,
    pub tags: Vec<String>,
    pub source_llm: String,
    pub source_conversation_id: Option<String>,
    pub version: i64,
    pub status: MemoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_referenced_at: DateTime<Utc>,
    pub reference_count: i64,

    // Decay
    pub decay_profile: DecayProfile,
    pub expires_at: Option<DateTime<Utc>>,
    pub needs_review: bool,
    pub review_due_at: Option<DateTime<Utc>>,
    pub event_date: Option<DateTime<Utc>>,

    // Provenance (newer columns; the insert path can fall back to a row
    // without them against a pre-migration schema)
    pub source_message_id: Option<String>,
    pub source_excerpt: Option<String>,
    pub suggestion_reason: Option<String>,
    pub review_note: Option<String>,

    /// 384-dim unit vector. Never serialized to clients.
    #[serde(skip)]
    pub embedding: Embedding,
}

impl MemoryRecord {
    /// Client projection: vector stripped, full content.
    pub fn projection(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "content": self.content,
            "level": self.level,
            "category": self.category,
            "importance_score": self.importance_score,
            "confidence_score": self.confidence_score,
            "privacy": self.privacy,
            "tags": self.tags,
            "source_llm": self.source_llm,
            "source_conversation_id": self.source_conversation_id,
            "version": self.version,
            "status": self.status,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "last_referenced_at": self.last_referenced_at,
            "reference_count": self.reference_count,
            "decay_profile": self.decay_profile,
            "expires_at": self.expires_at,
            "needs_review": self.needs_review,
            "review_due_at": self.review_due_at,
            "event_date": self.event_date,
            "suggestion_reason": self.suggestion_reason,
        })
    }

    /// Listing projection: metadata plus the first 100 chars of content.
    pub fn list_projection(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "content": preview(&self.content, 100),
            "category": self.category,
            "level": self.level,
            "importance_score": self.importance_score,
            "tags": self.tags,
            "source_llm": self.source_llm,
            "status": self.status,
            "created_at": self.created_at,
        })
    }
}

/// Truncate on a char boundary.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

// ============================================================================
// MEMORY VERSION / EVENT
// ============================================================================

/// Immutable snapshot of a memory's prior content, keyed by
/// `(memory_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryVersionRecord {
    pub id: String,
    pub memory_id: String,
    pub content: String,
    pub version: i64,
    pub changed_by: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only journal entry for the memory lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEventRecord {
    pub id: String,
    pub memory_id: String,
    pub kind: MemoryEventKind,
    pub detail: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// PENDING CONFLICT
// ============================================================================

/// A detected semantic contradiction awaiting human resolution.
/// `memory_id_a` is the pre-existing memory, `memory_id_b` the newcomer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConflictRecord {
    pub id: String,
    pub memory_id_a: String,
    pub memory_id_b: String,
    pub similarity_score: f64,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub status: ConflictStatus,
}

// ============================================================================
// GRAPH EDGE
// ============================================================================

/// Directed typed edge between two memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdgeRecord {
    pub id: String,
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub edge_type: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// CONVERSATION / MESSAGE
// ============================================================================

/// An imported conversation transcript header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub source_llm: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub summary: String,
    pub status: String,
    pub tags: Vec<String>,
    pub memory_ids: Vec<String>,
    pub raw_file_hash: String,
    pub imported_at: DateTime<Utc>,
}

/// A single transcript message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub embedding: Option<Embedding>,
}

// ============================================================================
// SESSION
// ============================================================================

/// Per-client session accounting (reads / writes / feedback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub api_key_id: String,
    pub source_llm: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub memory_ids_read: Vec<String>,
    pub memory_ids_written: Vec<String>,
    pub memory_ids_feedback: Vec<String>,
}

// ============================================================================
// ANALYSIS JOB / INDEX / CANDIDATE
// ============================================================================

/// Durable conversation-analysis job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub trigger: String,
    pub status: String,
    pub priority: i64,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
    pub result: serde_json::Value,
    pub error: String,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-conversation incremental analysis index row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisIndexRecord {
    pub conversation_id: String,
    pub message_count: i64,
    pub conversation_hash: String,
    pub latest_message_at: Option<DateTime<Utc>>,
    pub last_result: String,
    pub provider: String,
    pub signal_score: i64,
    pub candidates_count: i64,
    pub created_count: i64,
    pub error_count: i64,
    pub duration_ms: i64,
    pub last_analyzed_at: DateTime<Utc>,
}

/// A mined candidate awaiting promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningCandidateRecord {
    pub id: String,
    pub canonical_key: String,
    pub content: String,
    pub normalized_content: String,
    pub category: MemoryCategory,
    pub level: MemoryLevel,
    pub confidence_score: f64,
    pub source_provider: String,
    pub source_llm: String,
    pub evidence_count: i64,
    pub conversation_ids: Vec<String>,
    pub source_message_ids: Vec<String>,
    pub methods: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub promotion_score: f64,
    pub status: String,
    pub promoted_memory_id: Option<String>,
    pub last_result: String,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub embedding: Embedding,
}

impl MiningCandidateRecord {
    /// Number of distinct non-empty conversation ids.
    pub fn conversation_count(&self) -> usize {
        self.conversation_ids
            .iter()
            .filter(|v| !v.trim().is_empty())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 5), "héllo");
        assert_eq!(preview("short", 100), "short");
    }

    #[test]
    fn memory_projection_has_no_vector() {
        let record = MemoryRecord {
            id: "m1".into(),
            content: "The user prefers concise answers.".into(),
            level: MemoryLevel::Semantic,
            category: MemoryCategory::Preferences,
            importance_score: 0.5,
            confidence_score: 0.9,
            privacy: Privacy::Public,
            tags: vec![],
            source_llm: "claude".into(),
            source_conversation_id: None,
            version: 1,
            status: MemoryStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_referenced_at: Utc::now(),
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
        };
        let projection = record.projection();
        assert!(projection.get("embedding").is_none());
        assert!(projection.get("vector").is_none());
        assert_eq!(projection["version"], 1);
    }

    #[test]
    fn candidate_conversation_count_skips_blanks() {
        let record = MiningCandidateRecord {
            id: "c1".into(),
            canonical_key: "k".into(),
            content: "The user uses Rust daily.".into(),
            normalized_content: "the user uses rust daily".into(),
            category: MemoryCategory::Skills,
            level: MemoryLevel::Semantic,
            confidence_score: 0.9,
            source_provider: "heuristic".into(),
            source_llm: "conversation-analyzer:heuristic".into(),
            evidence_count: 1,
            conversation_ids: vec!["a".into(), "".into(), "b".into()],
            source_message_ids: vec![],
            methods: vec!["heuristic".into()],
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            promotion_score: 0.8,
            status: "pending".into(),
            promoted_memory_id: None,
            last_result: String::new(),
            last_error: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            embedding: Embedding::zero(),
        };
        assert_eq!(record.conversation_count(), 2);
    }
}
