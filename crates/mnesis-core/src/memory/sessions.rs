//! Session Tracking
//!
//! Per-client accounting of reads, writes, and feedback. Sessions are the
//! unit of observability for per-client behavior; activity updates merge id
//! lists as sets (union, not append).

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::storage::{Result, SessionRecord, Store};

/// Session tracker over the shared store.
#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<Store>,
}

impl SessionTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Open a new session and return its id.
    pub fn start_session(&self, source_llm: &str, api_key_id: Option<&str>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let session = SessionRecord {
            id: id.clone(),
            api_key_id: api_key_id.unwrap_or("unknown").to_string(),
            source_llm: source_llm.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
            memory_ids_read: vec![],
            memory_ids_written: vec![],
            memory_ids_feedback: vec![],
        };
        self.store.insert_session(&session)?;
        Ok(id)
    }

    /// Merge activity ids into the session. Unknown session ids are
    /// auto-created (lazy init for clients that skip `start_session`).
    pub fn update_activity(
        &self,
        session_id: &str,
        read_ids: &[String],
        write_ids: &[String],
        feedback_ids: &[String],
    ) -> Result<()> {
        if session_id.is_empty() {
            return Ok(());
        }

        let session = match self.store.get_session(session_id)? {
            Some(s) => s,
            None => {
                tracing::info!("Session {} not found, auto-creating", session_id);
                let session = SessionRecord {
                    id: session_id.to_string(),
                    api_key_id: "unknown".to_string(),
                    source_llm: "mcp".to_string(),
                    started_at: Utc::now(),
                    ended_at: None,
                    end_reason: None,
                    memory_ids_read: vec![],
                    memory_ids_written: vec![],
                    memory_ids_feedback: vec![],
                };
                self.store.insert_session(&session)?;
                session
            }
        };

        let read = union(&session.memory_ids_read, read_ids);
        let written = union(&session.memory_ids_written, write_ids);
        let feedback = union(&session.memory_ids_feedback, feedback_ids);
        self.store
            .update_session_lists(session_id, &read, &written, &feedback)
    }

    /// Close the session with a reason.
    pub fn end_session(&self, session_id: &str, reason: &str) -> Result<()> {
        if session_id.is_empty() {
            return Ok(());
        }
        self.store.end_session(session_id, reason, Utc::now())
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.store.get_session(session_id)
    }
}

fn union(existing: &[String], additions: &[String]) -> Vec<String> {
    let mut out = existing.to_vec();
    for id in additions {
        if !id.is_empty() && !out.contains(id) {
            out.push(id.clone());
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

    fn tracker() -> (tempfile::TempDir, SessionTracker) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("s.db"))).unwrap());
        (dir, SessionTracker::new(store))
    }

    #[test]
    fn activity_merges_as_sets() {
        let (_dir, tracker) = tracker();
        let id = tracker.start_session("claude", None).unwrap();

        tracker
            .update_activity(&id, &["m1".into(), "m2".into()], &[], &[])
            .unwrap();
        // Repeated ids do not duplicate.
        tracker
            .update_activity(&id, &["m2".into(), "m3".into()], &["m4".into()], &[])
            .unwrap();

        let session = tracker.get(&id).unwrap().unwrap();
        assert_eq!(session.memory_ids_read, vec!["m1", "m2", "m3"]);
        assert_eq!(session.memory_ids_written, vec!["m4"]);
    }

    #[test]
    fn unknown_session_is_auto_created() {
        let (_dir, tracker) = tracker();
        tracker
            .update_activity("ghost-session", &["m1".into()], &[], &[])
            .unwrap();
        let session = tracker.get("ghost-session").unwrap().unwrap();
        assert_eq!(session.memory_ids_read, vec!["m1"]);
        assert_eq!(session.source_llm, "mcp");
    }

    #[test]
    fn end_session_records_reason() {
        let (_dir, tracker) = tracker();
        let id = tracker.start_session("claude", Some("key-1")).unwrap();
        tracker.end_session(&id, "feedback_called").unwrap();
        let session = tracker.get(&id).unwrap().unwrap();
        assert!(session.ended_at.is_some());
        assert_eq!(session.end_reason.as_deref(), Some("feedback_called"));
        assert_eq!(session.api_key_id, "key-1");
    }
}
