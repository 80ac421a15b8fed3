//! Conflict Workbench
//!
//! Resolution surface for pending conflicts staged by the create path.
//! The detector is deliberately false-positive-biased, so every resolution
//! here is a human decision; each one lands a `conflict_resolved` event with
//! resolver and resolution.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::core::{MemoryCore, WriteOutcome};
use super::{ConflictStatus, MemoryEventKind, MemoryStatus};
use crate::storage::{MemoryEventRecord, PendingConflictRecord, Result, Store, StoreError};

/// How a pending conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the existing memory; no data change.
    KeptExisting,
    /// Replace the existing memory's content with merged text and archive
    /// the candidate.
    Merged,
    /// Both memories stay active; only the conflict row is archived.
    Versioned,
    /// Archive the existing memory, keep the candidate.
    Overwritten,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::KeptExisting => "kept_existing",
            ConflictResolution::Merged => "merged",
            ConflictResolution::Versioned => "versioned",
            ConflictResolution::Overwritten => "overwritten",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "kept_existing" => Some(ConflictResolution::KeptExisting),
            "merged" => Some(ConflictResolution::Merged),
            "versioned" => Some(ConflictResolution::Versioned),
            "overwritten" => Some(ConflictResolution::Overwritten),
            _ => None,
        }
    }
}

/// Pending-conflict listing and resolution over the shared core.
pub struct ConflictWorkbench {
    store: Arc<Store>,
}

impl ConflictWorkbench {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Pending conflicts, newest first.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<PendingConflictRecord>> {
        self.store.pending_conflicts(limit)
    }

    /// Resolve a conflict. `merged_content` is required for
    /// [`ConflictResolution::Merged`].
    pub async fn resolve(
        &self,
        core: &MemoryCore,
        conflict_id: &str,
        resolution: ConflictResolution,
        merged_content: Option<&str>,
        resolved_by: &str,
    ) -> Result<WriteOutcome> {
        let Some(conflict) = self.store.get_conflict(conflict_id)? else {
            return Err(StoreError::NotFound(format!("Conflict {conflict_id}")));
        };
        if conflict.status != ConflictStatus::Pending {
            return Ok(WriteOutcome {
                id: Some(conflict.id.clone()),
                status: conflict.status.as_str().into(),
                action: "already_resolved".into(),
                message: None,
                version: None,
            });
        }

        let now = Utc::now();
        let close_status;

        match resolution {
            ConflictResolution::KeptExisting => {
                close_status = ConflictStatus::Resolved;
            }
            ConflictResolution::Merged => {
                let Some(content) = merged_content else {
                    return Ok(WriteOutcome {
                        id: Some(conflict.id.clone()),
                        status: "error".into(),
                        action: "missing_merged_content".into(),
                        message: Some(
                            "Resolution 'merged' requires merged_content.".to_string(),
                        ),
                        version: None,
                    });
                };
                // The existing memory absorbs the merged text (version
                // bump archives its prior content); the candidate retires.
                core.update_memory(&conflict.memory_id_a, content, resolved_by, None)
                    .await?;
                core.delete_memory(&conflict.memory_id_b).await?;
                close_status = ConflictStatus::Resolved;
            }
            ConflictResolution::Versioned => {
                // Both memories stay; the conflict row itself is archived.
                close_status = ConflictStatus::Archived;
            }
            ConflictResolution::Overwritten => {
                core.delete_memory(&conflict.memory_id_a).await?;
                if let Some(candidate) = self.store.get_memory(&conflict.memory_id_b)? {
                    if candidate.status == MemoryStatus::PendingReview {
                        self.store.set_memory_status(
                            &conflict.memory_id_b,
                            MemoryStatus::Active,
                            now,
                        )?;
                        let event = MemoryEventRecord {
                            id: Uuid::new_v4().to_string(),
                            memory_id: conflict.memory_id_b.clone(),
                            kind: MemoryEventKind::Promoted,
                            detail: "conflict_overwrite".to_string(),
                            actor: resolved_by.to_string(),
                            created_at: now,
                        };
                        if let Err(e) = self.store.append_event(&event) {
                            tracing::warn!("Failed to append promoted event: {}", e);
                        }
                    }
                }
                close_status = ConflictStatus::Resolved;
            }
        }

        self.store.close_conflict(
            conflict_id,
            close_status,
            resolution.as_str(),
            resolved_by,
            now,
        )?;

        for memory_id in [&conflict.memory_id_a, &conflict.memory_id_b] {
            let event = MemoryEventRecord {
                id: Uuid::new_v4().to_string(),
                memory_id: memory_id.to_string(),
                kind: MemoryEventKind::ConflictResolved,
                detail: resolution.as_str().to_string(),
                actor: resolved_by.to_string(),
                created_at: now,
            };
            if let Err(e) = self.store.append_event(&event) {
                tracing::warn!("Failed to append conflict_resolved event: {}", e);
            }
        }

        Ok(WriteOutcome {
            id: Some(conflict.id),
            status: close_status.as_str().into(),
            action: resolution.as_str().into(),
            message: None,
            version: None,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
