//! SQLite Store Implementation
//!
//! One database file holds every Mnesis table. Vectors are little-endian
//! f32 BLOBs; similarity search is an exact cosine scan over the filtered
//! candidate set, returning `distance = 1 - cosine` (lower is nearer).
//!
//! Uses separate reader/writer connections for interior mutability. All
//! methods take `&self`, making Store `Send + Sync` so callers can share an
//! `Arc<Store>`. Serialization of mutations is the write queue's job, not
//! this layer's.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::records::{
    AnalysisIndexRecord, ConversationRecord, GraphEdgeRecord, JobRecord, MemoryEventRecord,
    MemoryRecord, MemoryVersionRecord, MessageRecord, MiningCandidateRecord,
    PendingConflictRecord, SessionRecord,
};
use super::{Result, StoreError};
use crate::embeddings::{cosine_similarity, Embedding};
use crate::memory::{
    ConflictStatus, DecayProfile, MemoryCategory, MemoryEventKind, MemoryLevel, MemoryStatus,
    Privacy,
};

/// Default database file name inside the data directory.
pub const DEFAULT_DB_FILE: &str = "mnesis.db";

// ============================================================================
// STORE
// ============================================================================

/// The embedded table store.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    db_path: PathBuf,
}

impl Store {
    /// Apply PRAGMAs to a connection.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path. `None` resolves to the
    /// platform data directory. Runs pending migrations on the writer.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => crate::config::data_dir().join(DEFAULT_DB_FILE),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(&path)?;

        // Restrict database file permissions to owner-only on Unix
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn, &path)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            db_path: path,
        })
    }

    /// Path of the underlying database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("Reader lock poisoned".into()))
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    /// Insert a memory row. On an "unknown column" failure against an older
    /// on-disk schema the insert is retried with the legacy base column set
    /// (dropping provenance columns added by later migrations).
    pub fn insert_memory(&self, memory: &MemoryRecord) -> Result<()> {
        let writer = self.writer()?;
        match Self::insert_memory_full(&writer, memory) {
            Ok(()) => Ok(()),
            Err(StoreError::SchemaMismatch(message)) => {
                tracing::warn!(
                    "Memory insert hit a legacy schema ({}); retrying with base columns",
                    message
                );
                Self::insert_memory_legacy(&writer, memory)
            }
            Err(e) => Err(e),
        }
    }

    fn insert_memory_full(conn: &Connection, m: &MemoryRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO memories (
                id, content, level, category, importance_score, confidence_score,
                privacy, tags, source_llm, source_conversation_id, version, status,
                created_at, updated_at, last_referenced_at, reference_count,
                decay_profile, expires_at, needs_review, review_due_at, event_date,
                source_message_id, source_excerpt, suggestion_reason, review_note,
                embedding
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
            )",
            params![
                m.id,
                m.content,
                m.level.as_str(),
                m.category.as_str(),
                m.importance_score,
                m.confidence_score,
                m.privacy.as_str(),
                json_list(&m.tags),
                m.source_llm,
                m.source_conversation_id,
                m.version,
                m.status.as_str(),
                m.created_at,
                m.updated_at,
                m.last_referenced_at,
                m.reference_count,
                m.decay_profile.as_str(),
                m.expires_at,
                m.needs_review,
                m.review_due_at,
                m.event_date,
                m.source_message_id,
                m.source_excerpt,
                m.suggestion_reason,
                m.review_note,
                m.embedding.to_bytes(),
            ],
        )
        .map_err(StoreError::classify)?;
        Ok(())
    }

    fn insert_memory_legacy(conn: &Connection, m: &MemoryRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO memories (
                id, content, level, category, importance_score, confidence_score,
                privacy, tags, source_llm, source_conversation_id, version, status,
                created_at, updated_at, last_referenced_at, reference_count,
                decay_profile, expires_at, needs_review, review_due_at, event_date,
                embedding
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )",
            params![
                m.id,
                m.content,
                m.level.as_str(),
                m.category.as_str(),
                m.importance_score,
                m.confidence_score,
                m.privacy.as_str(),
                json_list(&m.tags),
                m.source_llm,
                m.source_conversation_id,
                m.version,
                m.status.as_str(),
                m.created_at,
                m.updated_at,
                m.last_referenced_at,
                m.reference_count,
                m.decay_profile.as_str(),
                m.expires_at,
                m.needs_review,
                m.review_due_at,
                m.event_date,
                m.embedding.to_bytes(),
            ],
        )
        .map_err(StoreError::classify)?;
        Ok(())
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id],
                memory_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Exact cosine k-NN over memories, optionally filtered by status.
    /// Rows with a zero/absent vector are skipped. Returns
    /// `(record, distance)` with `distance = 1 - cosine`, ascending.
    pub fn nearest_memories(
        &self,
        vector: &[f32],
        k: usize,
        status: Option<MemoryStatus>,
    ) -> Result<Vec<(MemoryRecord, f32)>> {
        let rows = match status {
            Some(s) => self.memories_with_status(s, 200_000)?,
            None => self.all_memories(200_000)?,
        };
        let mut scored: Vec<(MemoryRecord, f32)> = rows
            .into_iter()
            .filter(|m| !m.embedding.is_zero())
            .map(|m| {
                let distance = 1.0 - cosine_similarity(vector, &m.embedding.vector);
                (m, distance)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn memories_with_status(
        &self,
        status: MemoryStatus,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE status = ?1 LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![status.as_str(), limit as i64], memory_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn all_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare(&format!("SELECT {MEMORY_COLUMNS} FROM memories LIMIT ?1"))?;
        let rows = stmt
            .query_map(params![limit as i64], memory_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Paged listing sorted by importance desc.
    pub fn list_memories(
        &self,
        category: Option<MemoryCategory>,
        level: Option<MemoryLevel>,
        status: MemoryStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let reader = self.reader()?;
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE status = ?1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(status.as_str().to_string())];
        if let Some(cat) = category {
            args.push(Box::new(cat.as_str().to_string()));
            sql.push_str(&format!(" AND category = ?{}", args.len()));
        }
        if let Some(lvl) = level {
            args.push(Box::new(lvl.as_str().to_string()));
            sql.push_str(&format!(" AND level = ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY importance_score DESC LIMIT ?{}", args.len()));
        args.push(Box::new(offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                memory_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_memories(&self, status: Option<MemoryStatus>) -> Result<i64> {
        let reader = self.reader()?;
        let count = match status {
            Some(s) => reader.query_row(
                "SELECT COUNT(*) FROM memories WHERE status = ?1",
                params![s.as_str()],
                |row| row.get(0),
            )?,
            None => reader.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    pub fn set_memory_status(&self, id: &str, status: MemoryStatus, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now],
        )?;
        Ok(())
    }

    /// Best-effort read-path bump: `reference_count += 1`,
    /// `last_referenced_at = now`.
    pub fn touch_memory_reference(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET reference_count = reference_count + 1,
                                 last_referenced_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Semantic-merge path: raise importance, refresh last reference.
    pub fn merge_memory_importance(
        &self,
        id: &str,
        importance: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET importance_score = ?2, last_referenced_at = ?3 WHERE id = ?1",
            params![id, importance, now],
        )?;
        Ok(())
    }

    /// Feedback path: set importance, bump reference count and timestamp.
    pub fn apply_feedback(&self, id: &str, importance: f64, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET importance_score = ?2,
                                 reference_count = reference_count + 1,
                                 last_referenced_at = ?3
             WHERE id = ?1",
            params![id, importance, now],
        )?;
        Ok(())
    }

    /// Decay-sweep path: importance only.
    pub fn set_memory_importance(&self, id: &str, importance: f64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET importance_score = ?2 WHERE id = ?1",
            params![id, importance],
        )?;
        Ok(())
    }

    /// Update path: new content, vector, version bump.
    #[allow(clippy::too_many_arguments)]
    pub fn update_memory_content(
        &self,
        id: &str,
        content: &str,
        embedding: &Embedding,
        version: i64,
        importance: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET content = ?2, embedding = ?3, version = ?4,
                                 importance_score = ?5, updated_at = ?6,
                                 last_referenced_at = ?6
             WHERE id = ?1",
            params![id, content, embedding.to_bytes(), version, importance, now],
        )?;
        Ok(())
    }

    // ========================================================================
    // MEMORY VERSIONS
    // ========================================================================

    pub fn insert_version(&self, version: &MemoryVersionRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_versions (id, memory_id, content, version, changed_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version.id,
                version.memory_id,
                version.content,
                version.version,
                version.changed_by,
                version.created_at,
            ],
        )?;
        Ok(())
    }

    /// All archived versions for a memory, ascending by version.
    pub fn versions_for(&self, memory_id: &str) -> Result<Vec<MemoryVersionRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, memory_id, content, version, changed_by, created_at
             FROM memory_versions WHERE memory_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt
            .query_map(params![memory_id], |row| {
                Ok(MemoryVersionRecord {
                    id: row.get(0)?,
                    memory_id: row.get(1)?,
                    content: row.get(2)?,
                    version: row.get(3)?,
                    changed_by: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // MEMORY EVENTS
    // ========================================================================

    pub fn append_event(&self, event: &MemoryEventRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_events (id, memory_id, kind, detail, actor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.memory_id,
                event.kind.as_str(),
                event.detail,
                event.actor,
                event.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn events_for(&self, memory_id: &str, limit: usize) -> Result<Vec<MemoryEventRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, memory_id, kind, detail, actor, created_at
             FROM memory_events WHERE memory_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![memory_id, limit as i64], |row| {
                Ok(MemoryEventRecord {
                    id: row.get(0)?,
                    memory_id: row.get(1)?,
                    kind: MemoryEventKind::parse_name(&row.get::<_, String>(2)?),
                    detail: row.get(3)?,
                    actor: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // PENDING CONFLICTS
    // ========================================================================

    pub fn insert_conflicts(&self, conflicts: &[PendingConflictRecord]) -> Result<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        for c in conflicts {
            writer.execute(
                "INSERT INTO pending_conflicts (
                    id, memory_id_a, memory_id_b, similarity_score, detected_at,
                    resolved_at, resolution, resolved_by, status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    c.id,
                    c.memory_id_a,
                    c.memory_id_b,
                    c.similarity_score,
                    c.detected_at,
                    c.resolved_at,
                    c.resolution,
                    c.resolved_by,
                    c.status.as_str(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn get_conflict(&self, id: &str) -> Result<Option<PendingConflictRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM pending_conflicts WHERE id = ?1"),
                params![id],
                conflict_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn pending_conflicts(&self, limit: usize) -> Result<Vec<PendingConflictRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM pending_conflicts
             WHERE status = 'pending' ORDER BY detected_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], conflict_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn close_conflict(
        &self,
        id: &str,
        status: ConflictStatus,
        resolution: &str,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE pending_conflicts
             SET status = ?2, resolution = ?3, resolved_by = ?4, resolved_at = ?5
             WHERE id = ?1",
            params![id, status.as_str(), resolution, resolved_by, now],
        )?;
        Ok(())
    }

    // ========================================================================
    // GRAPH EDGES
    // ========================================================================

    pub fn insert_edges(&self, edges: &[GraphEdgeRecord]) -> Result<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        let writer = self.writer()?;
        let mut inserted = 0usize;
        for e in edges {
            writer.execute(
                "INSERT INTO memory_graph_edges (
                    id, source_memory_id, target_memory_id, edge_type, score, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    e.id,
                    e.source_memory_id,
                    e.target_memory_id,
                    e.edge_type,
                    e.score,
                    e.created_at,
                ],
            )?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Delete every edge where the memory is source or target.
    pub fn delete_edges_for_memory(&self, memory_id: &str) -> Result<usize> {
        let writer = self.writer()?;
        let deleted = writer.execute(
            "DELETE FROM memory_graph_edges
             WHERE source_memory_id = ?1 OR target_memory_id = ?1",
            params![memory_id],
        )?;
        Ok(deleted)
    }

    pub fn all_edges(&self, limit: usize) -> Result<Vec<GraphEdgeRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, source_memory_id, target_memory_id, edge_type, score, created_at
             FROM memory_graph_edges LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(GraphEdgeRecord {
                    id: row.get(0)?,
                    source_memory_id: row.get(1)?,
                    target_memory_id: row.get(2)?,
                    edge_type: row.get(3)?,
                    score: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // CONVERSATIONS
    // ========================================================================

    pub fn upsert_conversation(&self, c: &ConversationRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO conversations (
                id, title, source_llm, started_at, ended_at, message_count, summary,
                status, tags, memory_ids, raw_file_hash, imported_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                c.id,
                c.title,
                c.source_llm,
                c.started_at,
                c.ended_at,
                c.message_count,
                c.summary,
                c.status,
                json_list(&c.tags),
                json_list(&c.memory_ids),
                c.raw_file_hash,
                c.imported_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
                conversation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn conversation_by_hash(&self, hash: &str) -> Result<Option<ConversationRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE raw_file_hash = ?1"
                ),
                params![hash],
                conversation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Non-deleted conversations, newest first.
    pub fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE status != 'deleted' ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], conversation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_conversations(
        &self,
        source_llm: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>> {
        let reader = self.reader()?;
        let rows = match source_llm {
            Some(source) => {
                let mut stmt = reader.prepare(&format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE status != 'deleted' AND source_llm = ?1
                     ORDER BY started_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt
                    .query_map(
                        params![source, limit as i64, offset as i64],
                        conversation_from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = reader.prepare(&format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE status != 'deleted'
                     ORDER BY started_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], conversation_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn set_conversation_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE conversations SET tags = ?2 WHERE id = ?1",
            params![id, json_list(tags)],
        )?;
        Ok(())
    }

    /// Union new memory ids into the conversation's `memory_ids` list.
    pub fn merge_conversation_memory_ids(&self, id: &str, memory_ids: &[String]) -> Result<bool> {
        let Some(existing) = self.get_conversation(id)? else {
            return Ok(false);
        };
        let mut merged = existing.memory_ids.clone();
        for mid in memory_ids {
            if !mid.is_empty() && !merged.contains(mid) {
                merged.push(mid.clone());
            }
        }
        let writer = self.writer()?;
        writer.execute(
            "UPDATE conversations SET memory_ids = ?2 WHERE id = ?1",
            params![id, json_list(&merged)],
        )?;
        Ok(true)
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    pub fn insert_messages(&self, messages: &[MessageRecord]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        for m in messages {
            writer.execute(
                "INSERT OR REPLACE INTO messages (
                    id, conversation_id, role, content, timestamp, embedding
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    m.id,
                    m.conversation_id,
                    m.role,
                    m.content,
                    m.timestamp,
                    m.embedding.as_ref().map(|e| e.to_bytes()),
                ],
            )?;
        }
        Ok(())
    }

    /// Messages of a conversation, ascending by timestamp.
    pub fn messages_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, conversation_id, role, content, timestamp, embedding
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                Ok(MessageRecord {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: row.get(4)?,
                    embedding: row
                        .get::<_, Option<Vec<u8>>>(5)?
                        .and_then(|b| Embedding::from_bytes(&b)),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    pub fn insert_session(&self, s: &SessionRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO sessions (
                id, api_key_id, source_llm, started_at, ended_at, end_reason,
                memory_ids_read, memory_ids_written, memory_ids_feedback
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                s.id,
                s.api_key_id,
                s.source_llm,
                s.started_at,
                s.ended_at,
                s.end_reason,
                json_list(&s.memory_ids_read),
                json_list(&s.memory_ids_written),
                json_list(&s.memory_ids_feedback),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                "SELECT id, api_key_id, source_llm, started_at, ended_at, end_reason,
                        memory_ids_read, memory_ids_written, memory_ids_feedback
                 FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_session_lists(
        &self,
        id: &str,
        read: &[String],
        written: &[String],
        feedback: &[String],
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET memory_ids_read = ?2, memory_ids_written = ?3,
                                 memory_ids_feedback = ?4
             WHERE id = ?1",
            params![id, json_list(read), json_list(written), json_list(feedback)],
        )?;
        Ok(())
    }

    pub fn end_session(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET ended_at = ?2, end_reason = ?3 WHERE id = ?1",
            params![id, now, reason],
        )?;
        Ok(())
    }

    /// Weekly maintenance: drop sessions that ended before the cutoff.
    pub fn delete_sessions_ended_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let writer = self.writer()?;
        let deleted = writer.execute(
            "DELETE FROM sessions WHERE ended_at IS NOT NULL AND ended_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // ========================================================================
    // ANALYSIS JOBS
    // ========================================================================

    pub fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO analysis_jobs (
                id, \"trigger\", status, priority, dedupe_key, payload, result, error,
                attempt_count, max_attempts, created_at, updated_at, started_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.trigger,
                job.status,
                job.priority,
                job.dedupe_key,
                job.payload.to_string(),
                job.result.to_string(),
                job.error,
                job.attempt_count,
                job.max_attempts,
                job.created_at,
                job.updated_at,
                job.started_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// An active (pending or running) job with the given dedupe key, if any.
    pub fn active_job_with_dedupe_key(&self, dedupe_key: &str) -> Result<Option<JobRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM analysis_jobs
                     WHERE dedupe_key = ?1 AND status IN ('pending', 'running')
                     LIMIT 1"
                ),
                params![dedupe_key],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Highest-priority pending job; ties broken by `created_at` asc.
    pub fn next_pending_job(&self) -> Result<Option<JobRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE status = 'pending'
                     ORDER BY priority DESC, created_at ASC LIMIT 1"
                ),
                [],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Atomically claim a pending job: flips it to running, bumps
    /// `attempt_count`, and returns the refreshed row. Returns `None` when
    /// the row was claimed (or finished) by someone else first.
    pub fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let claimed = {
            let writer = self.writer()?;
            writer.execute(
                "UPDATE analysis_jobs
                 SET status = 'running', attempt_count = attempt_count + 1,
                     started_at = ?2, updated_at = ?2, error = ''
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now],
            )?
        };
        if claimed == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    pub fn finish_job(
        &self,
        id: &str,
        status: &str,
        result: &serde_json::Value,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE analysis_jobs
             SET status = ?2, result = ?3, error = ?4, updated_at = ?5, completed_at = ?5
             WHERE id = ?1",
            params![id, status, result.to_string(), truncate(error, 500), now],
        )?;
        Ok(())
    }

    /// Requeue a failed attempt: back to pending with the error preserved
    /// and `started_at` cleared (attempt count is kept).
    pub fn requeue_job(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE analysis_jobs
             SET status = 'pending', error = ?2, updated_at = ?3, started_at = NULL
             WHERE id = ?1",
            params![id, truncate(error, 500), now],
        )?;
        Ok(())
    }

    pub fn running_jobs(&self) -> Result<Vec<JobRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE status = 'running'"
        ))?;
        let rows = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn job_status_counts(&self) -> Result<HashMap<String, i64>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT status, COUNT(*) FROM analysis_jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    pub fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Cancel a job only when still pending; returns the refreshed row.
    pub fn cancel_job_if_pending(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        {
            let writer = self.writer()?;
            writer.execute(
                "UPDATE analysis_jobs
                 SET status = 'cancelled', updated_at = ?2, completed_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now],
            )?;
        }
        self.get_job(id)
    }

    pub fn has_active_job_with_trigger_prefix(&self, prefix: &str) -> Result<bool> {
        let reader = self.reader()?;
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM analysis_jobs
             WHERE status IN ('pending', 'running') AND \"trigger\" LIKE ?1",
            params![pattern],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // ANALYSIS INDEX
    // ========================================================================

    pub fn analysis_index_map(&self) -> Result<HashMap<String, AnalysisIndexRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT conversation_id, message_count, conversation_hash, latest_message_at,
                    last_result, provider, signal_score, candidates_count, created_count,
                    error_count, duration_ms, last_analyzed_at
             FROM analysis_index",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AnalysisIndexRecord {
                    conversation_id: row.get(0)?,
                    message_count: row.get(1)?,
                    conversation_hash: row.get(2)?,
                    latest_message_at: row.get(3)?,
                    last_result: row.get(4)?,
                    provider: row.get(5)?,
                    signal_score: row.get(6)?,
                    candidates_count: row.get(7)?,
                    created_count: row.get(8)?,
                    error_count: row.get(9)?,
                    duration_ms: row.get(10)?,
                    last_analyzed_at: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|r| (r.conversation_id.clone(), r))
            .collect())
    }

    pub fn upsert_analysis_index(&self, row: &AnalysisIndexRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO analysis_index (
                conversation_id, message_count, conversation_hash, latest_message_at,
                last_result, provider, signal_score, candidates_count, created_count,
                error_count, duration_ms, last_analyzed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.conversation_id,
                row.message_count,
                row.conversation_hash,
                row.latest_message_at,
                row.last_result,
                row.provider,
                row.signal_score,
                row.candidates_count,
                row.created_count,
                row.error_count,
                row.duration_ms,
                row.last_analyzed_at,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // MINING CANDIDATES
    // ========================================================================

    pub fn insert_candidate(&self, c: &MiningCandidateRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO analysis_candidates (
                id, canonical_key, content, normalized_content, category, level,
                confidence_score, source_provider, source_llm, evidence_count,
                conversation_ids, source_message_ids, methods, first_seen_at,
                last_seen_at, promotion_score, status, promoted_memory_id,
                last_result, last_error, created_at, updated_at, embedding
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                c.id,
                c.canonical_key,
                c.content,
                c.normalized_content,
                c.category.as_str(),
                c.level.as_str(),
                c.confidence_score,
                c.source_provider,
                c.source_llm,
                c.evidence_count,
                json_list(&c.conversation_ids),
                json_list(&c.source_message_ids),
                json_list(&c.methods),
                c.first_seen_at,
                c.last_seen_at,
                c.promotion_score,
                c.status,
                c.promoted_memory_id,
                c.last_result,
                c.last_error,
                c.created_at,
                c.updated_at,
                c.embedding.to_bytes(),
            ],
        )?;
        Ok(())
    }

    pub fn get_candidate(&self, id: &str) -> Result<Option<MiningCandidateRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {CANDIDATE_COLUMNS} FROM analysis_candidates WHERE id = ?1"),
                params![id],
                candidate_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn candidate_by_canonical_key(
        &self,
        canonical_key: &str,
    ) -> Result<Option<MiningCandidateRecord>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM analysis_candidates
                     WHERE canonical_key = ?1 LIMIT 1"
                ),
                params![canonical_key],
                candidate_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Exact cosine k-NN over non-rejected candidates.
    pub fn nearest_candidates(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(MiningCandidateRecord, f32)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM analysis_candidates
             WHERE status != 'rejected' LIMIT 200000"
        ))?;
        let rows = stmt
            .query_map([], candidate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(reader);

        let mut scored: Vec<(MiningCandidateRecord, f32)> = rows
            .into_iter()
            .filter(|c| !c.embedding.is_zero())
            .map(|c| {
                let distance = 1.0 - cosine_similarity(vector, &c.embedding.vector);
                (c, distance)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Full-row candidate update (merge path).
    pub fn update_candidate(&self, c: &MiningCandidateRecord) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE analysis_candidates SET
                content = ?2, normalized_content = ?3, category = ?4, level = ?5,
                confidence_score = ?6, source_provider = ?7, source_llm = ?8,
                evidence_count = ?9, conversation_ids = ?10, source_message_ids = ?11,
                methods = ?12, first_seen_at = ?13, last_seen_at = ?14,
                promotion_score = ?15, status = ?16, last_error = ?17,
                updated_at = ?18, embedding = ?19
             WHERE id = ?1",
            params![
                c.id,
                c.content,
                c.normalized_content,
                c.category.as_str(),
                c.level.as_str(),
                c.confidence_score,
                c.source_provider,
                c.source_llm,
                c.evidence_count,
                json_list(&c.conversation_ids),
                json_list(&c.source_message_ids),
                json_list(&c.methods),
                c.first_seen_at,
                c.last_seen_at,
                c.promotion_score,
                c.status,
                c.last_error,
                c.updated_at,
                c.embedding.to_bytes(),
            ],
        )?;
        Ok(())
    }

    /// Record a promotion outcome on a candidate.
    pub fn update_candidate_result(
        &self,
        id: &str,
        status: &str,
        result: &str,
        error: &str,
        promoted_memory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE analysis_candidates
             SET status = ?2, last_result = ?3, last_error = ?4,
                 promoted_memory_id = ?5, updated_at = ?6
             WHERE id = ?1",
            params![id, status, result, truncate(error, 420), promoted_memory_id, now],
        )?;
        Ok(())
    }

    pub fn count_candidates(&self, status: Option<&str>) -> Result<i64> {
        let reader = self.reader()?;
        let count = match status {
            Some(s) => reader.query_row(
                "SELECT COUNT(*) FROM analysis_candidates WHERE status = ?1",
                params![s],
                |row| row.get(0),
            )?,
            None => {
                reader.query_row("SELECT COUNT(*) FROM analysis_candidates", [], |row| {
                    row.get(0)
                })?
            }
        };
        Ok(count)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Reclaim space and refresh planner statistics.
    pub fn compact(&self) -> Result<()> {
        let writer = self.writer()?;
        writer.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const MEMORY_COLUMNS: &str = "id, content, level, category, importance_score, confidence_score, \
     privacy, tags, source_llm, source_conversation_id, version, status, created_at, \
     updated_at, last_referenced_at, reference_count, decay_profile, expires_at, \
     needs_review, review_due_at, event_date, source_message_id, source_excerpt, \
     suggestion_reason, review_note, embedding";

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        content: row.get(1)?,
        level: MemoryLevel::parse_name(&row.get::<_, String>(2)?),
        category: MemoryCategory::parse_name(&row.get::<_, String>(3)?),
        importance_score: row.get(4)?,
        confidence_score: row.get(5)?,
        privacy: Privacy::parse_name(&row.get::<_, String>(6)?),
        tags: parse_json_list(row.get::<_, Option<String>>(7)?),
        source_llm: row.get(8)?,
        source_conversation_id: row.get(9)?,
        version: row.get(10)?,
        status: MemoryStatus::parse_name(&row.get::<_, String>(11)?),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        last_referenced_at: row.get(14)?,
        reference_count: row.get(15)?,
        decay_profile: DecayProfile::parse_name(
            &row.get::<_, Option<String>>(16)?.unwrap_or_default(),
        ),
        expires_at: row.get(17)?,
        needs_review: row.get::<_, Option<bool>>(18)?.unwrap_or(false),
        review_due_at: row.get(19)?,
        event_date: row.get(20)?,
        source_message_id: row.get(21)?,
        source_excerpt: row.get(22)?,
        suggestion_reason: row.get(23)?,
        review_note: row.get(24)?,
        embedding: row
            .get::<_, Option<Vec<u8>>>(25)?
            .and_then(|b| Embedding::from_bytes(&b))
            .unwrap_or_else(Embedding::zero),
    })
}

const CONFLICT_COLUMNS: &str = "id, memory_id_a, memory_id_b, similarity_score, detected_at, \
     resolved_at, resolution, resolved_by, status";

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<PendingConflictRecord> {
    Ok(PendingConflictRecord {
        id: row.get(0)?,
        memory_id_a: row.get(1)?,
        memory_id_b: row.get(2)?,
        similarity_score: row.get(3)?,
        detected_at: row.get(4)?,
        resolved_at: row.get(5)?,
        resolution: row.get(6)?,
        resolved_by: row.get(7)?,
        status: ConflictStatus::parse_name(&row.get::<_, String>(8)?),
    })
}

const CONVERSATION_COLUMNS: &str = "id, title, source_llm, started_at, ended_at, message_count, \
     summary, status, tags, memory_ids, raw_file_hash, imported_at";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        source_llm: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        message_count: row.get(5)?,
        summary: row.get(6)?,
        status: row.get(7)?,
        tags: parse_json_list(row.get::<_, Option<String>>(8)?),
        memory_ids: parse_json_list(row.get::<_, Option<String>>(9)?),
        raw_file_hash: row.get(10)?,
        imported_at: row.get(11)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        api_key_id: row.get(1)?,
        source_llm: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        end_reason: row.get(5)?,
        memory_ids_read: parse_json_list(row.get::<_, Option<String>>(6)?),
        memory_ids_written: parse_json_list(row.get::<_, Option<String>>(7)?),
        memory_ids_feedback: parse_json_list(row.get::<_, Option<String>>(8)?),
    })
}

const JOB_COLUMNS: &str = "id, \"trigger\", status, priority, dedupe_key, payload, result, error, \
     attempt_count, max_attempts, created_at, updated_at, started_at, completed_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        trigger: row.get(1)?,
        status: row.get(2)?,
        priority: row.get(3)?,
        dedupe_key: row.get(4)?,
        payload: parse_json_value(row.get::<_, Option<String>>(5)?),
        result: parse_json_value(row.get::<_, Option<String>>(6)?),
        error: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        attempt_count: row.get(8)?,
        max_attempts: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

const CANDIDATE_COLUMNS: &str = "id, canonical_key, content, normalized_content, category, level, \
     confidence_score, source_provider, source_llm, evidence_count, conversation_ids, \
     source_message_ids, methods, first_seen_at, last_seen_at, promotion_score, status, \
     promoted_memory_id, last_result, last_error, created_at, updated_at, embedding";

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<MiningCandidateRecord> {
    Ok(MiningCandidateRecord {
        id: row.get(0)?,
        canonical_key: row.get(1)?,
        content: row.get(2)?,
        normalized_content: row.get(3)?,
        category: MemoryCategory::parse_name(&row.get::<_, String>(4)?),
        level: MemoryLevel::parse_name(&row.get::<_, String>(5)?),
        confidence_score: row.get(6)?,
        source_provider: row.get(7)?,
        source_llm: row.get(8)?,
        evidence_count: row.get(9)?,
        conversation_ids: parse_json_list(row.get::<_, Option<String>>(10)?),
        source_message_ids: parse_json_list(row.get::<_, Option<String>>(11)?),
        methods: parse_json_list(row.get::<_, Option<String>>(12)?),
        first_seen_at: row.get(13)?,
        last_seen_at: row.get(14)?,
        promotion_score: row.get(15)?,
        status: row.get(16)?,
        promoted_memory_id: row.get(17)?,
        last_result: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
        last_error: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
        embedding: row
            .get::<_, Option<Vec<u8>>>(22)?
            .and_then(|b| Embedding::from_bytes(&b))
            .unwrap_or_else(Embedding::zero),
    })
}

// ============================================================================
// HELPERS
// ============================================================================

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn parse_json_value(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn truncate(text: &str, max_chars: usize) -> String {
    super::records::preview(text, max_chars)
}

// ============================================================================
// TESTS
// ============================================================================
