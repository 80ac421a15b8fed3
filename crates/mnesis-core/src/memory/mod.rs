//! Memory Lifecycle
//!
//! The entity vocabulary (levels, categories, statuses, decay profiles) plus
//! the lifecycle subsystems: the serialized write queue, validation and
//! dedup in `core`, decay classification, conflict detection and the
//! resolution workbench, and per-client session tracking.

pub mod conflicts;
pub mod core;
pub mod decay;
pub mod sessions;
pub mod workbench;
pub mod write_queue;

use serde::{Deserialize, Serialize};

// ============================================================================
// ENTITY VOCABULARY
// ============================================================================

/// Memory level — how durable the fact is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLevel {
    /// Lasting facts about the user
    #[default]
    Semantic,
    /// Past events and experiences
    Episodic,
    /// Short-lived context (72h horizon)
    Working,
}

impl MemoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLevel::Semantic => "semantic",
            MemoryLevel::Episodic => "episodic",
            MemoryLevel::Working => "working",
        }
    }

    /// Parse from a string, mapping common aliases; unknown values default
    /// to semantic.
    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "semantic" | "stable" | "long_term" | "long-term" => MemoryLevel::Semantic,
            "episodic" => MemoryLevel::Episodic,
            "working" | "temporary" | "short_term" | "short-term" => MemoryLevel::Working,
            _ => MemoryLevel::Semantic,
        }
    }
}

impl std::fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Memory category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Identity,
    #[default]
    Preferences,
    Skills,
    Relationships,
    Projects,
    History,
    Working,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Identity => "identity",
            MemoryCategory::Preferences => "preferences",
            MemoryCategory::Skills => "skills",
            MemoryCategory::Relationships => "relationships",
            MemoryCategory::Projects => "projects",
            MemoryCategory::History => "history",
            MemoryCategory::Working => "working",
        }
    }

    /// Parse from a string, mapping the aliases LLM providers tend to emit;
    /// unknown values default to preferences.
    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "identity" | "about_user" | "profile" => MemoryCategory::Identity,
            "preference" | "preferences" | "working_style" => MemoryCategory::Preferences,
            "skill" | "skills" | "tech_stack" => MemoryCategory::Skills,
            "relationship" | "relationships" => MemoryCategory::Relationships,
            "project" | "projects" => MemoryCategory::Projects,
            "history" | "event" => MemoryCategory::History,
            "working" => MemoryCategory::Working,
            _ => MemoryCategory::Preferences,
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Privacy classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    #[default]
    Public,
    Sensitive,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Sensitive => "sensitive",
            Privacy::Private => "private",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sensitive" => Privacy::Sensitive,
            "private" => Privacy::Private,
            _ => Privacy::Public,
        }
    }
}

/// Memory status. Memories are never physically deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    #[default]
    Active,
    PendingReview,
    Archived,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::PendingReview => "pending_review",
            MemoryStatus::Archived => "archived",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pending_review" => MemoryStatus::PendingReview,
            "archived" => MemoryStatus::Archived,
            _ => MemoryStatus::Active,
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Temporal-validity classification governing expiry and review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DecayProfile {
    #[serde(rename = "permanent")]
    Permanent,
    #[default]
    #[serde(rename = "stable")]
    Stable,
    #[serde(rename = "semi-stable")]
    SemiStable,
    #[serde(rename = "volatile")]
    Volatile,
    #[serde(rename = "event-based")]
    EventBased,
}

impl DecayProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecayProfile::Permanent => "permanent",
            DecayProfile::Stable => "stable",
            DecayProfile::SemiStable => "semi-stable",
            DecayProfile::Volatile => "volatile",
            DecayProfile::EventBased => "event-based",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "permanent" => DecayProfile::Permanent,
            "semi-stable" => DecayProfile::SemiStable,
            "volatile" => DecayProfile::Volatile,
            "event-based" => DecayProfile::EventBased,
            _ => DecayProfile::Stable,
        }
    }
}

/// Journal event kinds for the append-only memory event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind {
    Created,
    Updated,
    Merged,
    Archived,
    Restored,
    Promoted,
    ConflictOpened,
    ConflictResolved,
}

impl MemoryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventKind::Created => "created",
            MemoryEventKind::Updated => "updated",
            MemoryEventKind::Merged => "merged",
            MemoryEventKind::Archived => "archived",
            MemoryEventKind::Restored => "restored",
            MemoryEventKind::Promoted => "promoted",
            MemoryEventKind::ConflictOpened => "conflict_opened",
            MemoryEventKind::ConflictResolved => "conflict_resolved",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "updated" => MemoryEventKind::Updated,
            "merged" => MemoryEventKind::Merged,
            "archived" => MemoryEventKind::Archived,
            "restored" => MemoryEventKind::Restored,
            "promoted" => MemoryEventKind::Promoted,
            "conflict_opened" => MemoryEventKind::ConflictOpened,
            "conflict_resolved" => MemoryEventKind::ConflictResolved,
            _ => MemoryEventKind::Created,
        }
    }
}

/// Pending-conflict row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    #[default]
    Pending,
    Resolved,
    Archived,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Archived => "archived",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "resolved" => ConflictStatus::Resolved,
            "archived" => ConflictStatus::Archived,
            _ => ConflictStatus::Pending,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trip() {
        for level in [MemoryLevel::Semantic, MemoryLevel::Episodic, MemoryLevel::Working] {
            assert_eq!(MemoryLevel::parse_name(level.as_str()), level);
        }
    }

    #[test]
    fn level_aliases() {
        assert_eq!(MemoryLevel::parse_name("long-term"), MemoryLevel::Semantic);
        assert_eq!(MemoryLevel::parse_name("short_term"), MemoryLevel::Working);
        assert_eq!(MemoryLevel::parse_name("???"), MemoryLevel::Semantic);
    }

    #[test]
    fn category_aliases() {
        assert_eq!(MemoryCategory::parse_name("about_user"), MemoryCategory::Identity);
        assert_eq!(MemoryCategory::parse_name("tech_stack"), MemoryCategory::Skills);
        assert_eq!(MemoryCategory::parse_name("event"), MemoryCategory::History);
        assert_eq!(MemoryCategory::parse_name("unknown"), MemoryCategory::Preferences);
    }

    #[test]
    fn status_serde_names() {
        assert_eq!(
            serde_json::to_string(&MemoryStatus::PendingReview).unwrap(),
            "\"pending_review\""
        );
        assert_eq!(
            serde_json::to_string(&DecayProfile::SemiStable).unwrap(),
            "\"semi-stable\""
        );
        assert_eq!(
            serde_json::to_string(&DecayProfile::EventBased).unwrap(),
            "\"event-based\""
        );
    }

    #[test]
    fn decay_profile_round_trip() {
        for profile in [
            DecayProfile::Permanent,
            DecayProfile::Stable,
            DecayProfile::SemiStable,
            DecayProfile::Volatile,
            DecayProfile::EventBased,
        ] {
            assert_eq!(DecayProfile::parse_name(profile.as_str()), profile);
        }
    }
}
