//! Database Migrations
//!
//! Ordered, idempotent schema migrations. The last-applied version lives in
//! a plaintext `schema_version.txt` next to the database file. Migrations
//! only create tables and add columns with defaults; nothing is removed or
//! renamed, with one exception: a targeted repair migration that rebuilds a
//! known-bad legacy `memories` table (missing the decay columns) behind a
//! timestamped backup table.

use std::path::Path;

use rusqlite::{params, Connection};

use super::{Result, StoreError};

/// Version after all migrations have been applied.
pub const LATEST_VERSION: u32 = 8;

enum MigrationStep {
    /// Idempotent batch SQL.
    Sql(&'static str),
    /// Guarded column additions: `(table, column, declaration)`.
    AddColumns(&'static [(&'static str, &'static str, &'static str)]),
    /// Rebuild of the legacy memories schema.
    RepairMemories,
}

struct Migration {
    version: u32,
    description: &'static str,
    step: MigrationStep,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema",
        step: MigrationStep::Sql(MIGRATION_V1),
    },
    Migration {
        version: 2,
        description: "Decay fields on memories",
        step: MigrationStep::AddColumns(&[
            ("memories", "decay_profile", "TEXT DEFAULT 'stable'"),
            ("memories", "expires_at", "TEXT"),
            ("memories", "needs_review", "INTEGER DEFAULT 0"),
            ("memories", "review_due_at", "TEXT"),
            ("memories", "event_date", "TEXT"),
        ]),
    },
    Migration {
        version: 3,
        description: "Pending conflicts and graph edges",
        step: MigrationStep::Sql(MIGRATION_V3),
    },
    Migration {
        version: 4,
        description: "Conversation analysis jobs and index",
        step: MigrationStep::Sql(MIGRATION_V4),
    },
    Migration {
        version: 5,
        description: "Provenance and review metadata on memories",
        step: MigrationStep::AddColumns(&[
            ("memories", "source_message_id", "TEXT"),
            ("memories", "source_excerpt", "TEXT"),
            ("memories", "suggestion_reason", "TEXT"),
            ("memories", "review_note", "TEXT"),
        ]),
    },
    Migration {
        version: 6,
        description: "Conversation analysis candidates",
        step: MigrationStep::Sql(MIGRATION_V6),
    },
    Migration {
        version: 7,
        description: "Append-only memory events journal",
        step: MigrationStep::Sql(MIGRATION_V7),
    },
    Migration {
        version: 8,
        description: "Repair legacy memories schema missing decay columns",
        step: MigrationStep::RepairMemories,
    },
];

/// V1: the full current schema. Later migrations are no-ops on fresh
/// installs and upgrade paths for existing databases.
const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    level TEXT NOT NULL DEFAULT 'semantic',
    category TEXT NOT NULL DEFAULT 'preferences',
    importance_score REAL NOT NULL DEFAULT 0.5,
    confidence_score REAL NOT NULL DEFAULT 0.7,
    privacy TEXT NOT NULL DEFAULT 'public',
    tags TEXT DEFAULT '[]',
    source_llm TEXT NOT NULL DEFAULT '',
    source_conversation_id TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_referenced_at TEXT NOT NULL,
    reference_count INTEGER NOT NULL DEFAULT 0,
    decay_profile TEXT DEFAULT 'stable',
    expires_at TEXT,
    needs_review INTEGER DEFAULT 0,
    review_due_at TEXT,
    event_date TEXT,
    source_message_id TEXT,
    source_excerpt TEXT,
    suggestion_reason TEXT,
    review_note TEXT,
    embedding BLOB
);

CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
CREATE INDEX IF NOT EXISTS idx_memories_level ON memories(level);
CREATE INDEX IF NOT EXISTS idx_memories_last_referenced ON memories(last_referenced_at);

CREATE TABLE IF NOT EXISTS memory_versions (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL,
    content TEXT NOT NULL,
    version INTEGER NOT NULL,
    changed_by TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_versions_memory ON memory_versions(memory_id);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    source_llm TEXT NOT NULL DEFAULT '',
    started_at TEXT NOT NULL,
    ended_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    summary TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'archived',
    tags TEXT DEFAULT '[]',
    memory_ids TEXT DEFAULT '[]',
    raw_file_hash TEXT NOT NULL DEFAULT '',
    imported_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_started ON conversations(started_at);
CREATE INDEX IF NOT EXISTS idx_conversations_hash ON conversations(raw_file_hash);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    embedding BLOB
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    api_key_id TEXT NOT NULL DEFAULT 'unknown',
    source_llm TEXT NOT NULL DEFAULT '',
    started_at TEXT NOT NULL,
    ended_at TEXT,
    end_reason TEXT,
    memory_ids_read TEXT DEFAULT '[]',
    memory_ids_written TEXT DEFAULT '[]',
    memory_ids_feedback TEXT DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at);
"#;

/// V3: conflict workbench and knowledge-graph edge tables.
const MIGRATION_V3: &str = r#"
CREATE TABLE IF NOT EXISTS pending_conflicts (
    id TEXT PRIMARY KEY,
    memory_id_a TEXT NOT NULL,
    memory_id_b TEXT NOT NULL,
    similarity_score REAL NOT NULL DEFAULT 0.0,
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution TEXT,
    resolved_by TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_conflicts_status ON pending_conflicts(status);

CREATE TABLE IF NOT EXISTS memory_graph_edges (
    id TEXT PRIMARY KEY,
    source_memory_id TEXT NOT NULL,
    target_memory_id TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    score REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON memory_graph_edges(source_memory_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON memory_graph_edges(target_memory_id);
"#;

/// V4: persistent job queue and incremental analysis index.
const MIGRATION_V4: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id TEXT PRIMARY KEY,
    "trigger" TEXT NOT NULL DEFAULT 'manual',
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    dedupe_key TEXT NOT NULL DEFAULT '',
    payload TEXT DEFAULT '{}',
    result TEXT DEFAULT '{}',
    error TEXT DEFAULT '',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON analysis_jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_dedupe ON analysis_jobs(dedupe_key);

CREATE TABLE IF NOT EXISTS analysis_index (
    conversation_id TEXT PRIMARY KEY,
    message_count INTEGER NOT NULL DEFAULT 0,
    conversation_hash TEXT NOT NULL DEFAULT '',
    latest_message_at TEXT,
    last_result TEXT NOT NULL DEFAULT 'none',
    provider TEXT NOT NULL DEFAULT 'heuristic',
    signal_score INTEGER NOT NULL DEFAULT 0,
    candidates_count INTEGER NOT NULL DEFAULT 0,
    created_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    last_analyzed_at TEXT NOT NULL
);
"#;

/// V6: durable mined candidates (pre-promotion dedup layer).
const MIGRATION_V6: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_candidates (
    id TEXT PRIMARY KEY,
    canonical_key TEXT NOT NULL,
    content TEXT NOT NULL,
    normalized_content TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT 'preferences',
    level TEXT NOT NULL DEFAULT 'semantic',
    confidence_score REAL NOT NULL DEFAULT 0.8,
    source_provider TEXT NOT NULL DEFAULT 'heuristic',
    source_llm TEXT NOT NULL DEFAULT '',
    evidence_count INTEGER NOT NULL DEFAULT 1,
    conversation_ids TEXT DEFAULT '[]',
    source_message_ids TEXT DEFAULT '[]',
    methods TEXT DEFAULT '[]',
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    promotion_score REAL NOT NULL DEFAULT 0.0,
    status TEXT NOT NULL DEFAULT 'pending',
    promoted_memory_id TEXT,
    last_result TEXT DEFAULT '',
    last_error TEXT DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    embedding BLOB
);

CREATE INDEX IF NOT EXISTS idx_candidates_key ON analysis_candidates(canonical_key);
CREATE INDEX IF NOT EXISTS idx_candidates_status ON analysis_candidates(status);
"#;

/// V7: append-only memory events journal.
const MIGRATION_V7: &str = r#"
CREATE TABLE IF NOT EXISTS memory_events (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL DEFAULT '',
    actor TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_memory ON memory_events(memory_id);
"#;

// ============================================================================
// VERSION FILE
// ============================================================================

fn version_file(db_path: &Path) -> std::path::PathBuf {
    db_path
        .parent()
        .map(|p| p.join("schema_version.txt"))
        .unwrap_or_else(|| std::path::PathBuf::from("schema_version.txt"))
}

fn read_version(db_path: &Path) -> u32 {
    std::fs::read_to_string(version_file(db_path))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

fn write_version(db_path: &Path, version: u32) -> Result<()> {
    let path = version_file(db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, version.to_string())?;
    Ok(())
}

// ============================================================================
// APPLY
// ============================================================================

/// Run pending migrations in order, recording each applied version.
pub fn apply_migrations(conn: &Connection, db_path: &Path) -> Result<u32> {
    let current = read_version(db_path);
    let mut applied = 0u32;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            "Applying migration v{}: {}",
            migration.version,
            migration.description
        );
        match &migration.step {
            MigrationStep::Sql(sql) => conn.execute_batch(sql)?,
            MigrationStep::AddColumns(columns) => {
                for (table, column, declaration) in *columns {
                    add_column_if_missing(conn, table, column, declaration)?;
                }
            }
            MigrationStep::RepairMemories => repair_memories_schema(conn)?,
        }
        write_version(db_path, migration.version)?;
        applied += 1;
    }

    Ok(applied)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    declaration: &str,
) -> Result<()> {
    let existing = table_columns(conn, table)?;
    if existing.iter().any(|c| c == column) {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {declaration};"))?;
    tracing::info!("Added column {}.{}", table, column);
    Ok(())
}

// ============================================================================
// REPAIR
// ============================================================================

const REQUIRED_DECAY_COLUMNS: &[&str] = &[
    "decay_profile",
    "expires_at",
    "needs_review",
    "review_due_at",
    "event_date",
];

/// Rebuild a legacy `memories` table that predates the decay columns:
/// copy all rows aside into a timestamped backup table, drop and recreate
/// the table with the current schema, and re-insert normalized rows in
/// 1000-row batches. The backup table is kept.
fn repair_memories_schema(conn: &Connection) -> Result<()> {
    let present = table_columns(conn, "memories")?;
    if present.is_empty() {
        return Ok(());
    }
    let missing: Vec<&str> = REQUIRED_DECAY_COLUMNS
        .iter()
        .filter(|c| !present.iter().any(|p| p == *c))
        .copied()
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    tracing::warn!(
        "Legacy memories schema detected, missing fields: {}",
        missing.join(", ")
    );

    let rows = read_generic_rows(conn, "memories", &present)?;

    let backup_name = format!(
        "memories_legacy_backup_{}_{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..6]
    );
    conn.execute_batch(&format!(
        "CREATE TABLE {backup_name} AS SELECT * FROM memories;"
    ))?;

    conn.execute_batch("DROP TABLE memories;")?;
    conn.execute_batch(MIGRATION_V1)?;

    let now = chrono::Utc::now().to_rfc3339();
    let mut inserted = 0usize;
    for batch in rows.chunks(1000) {
        for row in batch {
            let get = |name: &str| row.get(name).cloned();
            let get_text = |name: &str, default: &str| match get(name) {
                Some(rusqlite::types::Value::Text(t)) => t,
                _ => default.to_string(),
            };
            let get_real = |name: &str, default: f64| match get(name) {
                Some(rusqlite::types::Value::Real(v)) => v,
                Some(rusqlite::types::Value::Integer(v)) => v as f64,
                _ => default,
            };
            let get_int = |name: &str, default: i64| match get(name) {
                Some(rusqlite::types::Value::Integer(v)) => v,
                _ => default,
            };
            let embedding = match get("embedding") {
                Some(rusqlite::types::Value::Blob(b)) => Some(b),
                _ => None,
            };
            let id = {
                let raw = get_text("id", "");
                if raw.is_empty() {
                    uuid::Uuid::new_v4().to_string()
                } else {
                    raw
                }
            };
            conn.execute(
                "INSERT INTO memories (
                    id, content, level, category, importance_score, confidence_score,
                    privacy, tags, source_llm, source_conversation_id, version, status,
                    created_at, updated_at, last_referenced_at, reference_count,
                    decay_profile, expires_at, needs_review, review_due_at, event_date,
                    source_message_id, source_excerpt, suggestion_reason, review_note,
                    embedding
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                           ?15, ?16, ?17, NULL, 0, NULL, NULL, ?18, ?19, ?20, ?21, ?22)",
                params![
                    id,
                    get_text("content", ""),
                    get_text("level", "semantic"),
                    get_text("category", "preferences"),
                    get_real("importance_score", 0.5),
                    get_real("confidence_score", 0.7),
                    get_text("privacy", "public"),
                    get_text("tags", "[]"),
                    get_text("source_llm", "legacy"),
                    match get("source_conversation_id") {
                        Some(rusqlite::types::Value::Text(t)) if !t.is_empty() => Some(t),
                        _ => None,
                    },
                    get_int("version", 1),
                    get_text("status", "active"),
                    get_text("created_at", &now),
                    get_text("updated_at", &now),
                    get_text("last_referenced_at", &now),
                    get_int("reference_count", 0),
                    get_text("decay_profile", "stable"),
                    get_text("source_message_id", ""),
                    get_text("source_excerpt", ""),
                    get_text("suggestion_reason", ""),
                    get_text("review_note", ""),
                    embedding,
                ],
            )?;
            inserted += 1;
        }
    }

    tracing::info!(
        "Memories schema repair completed. rows={}, backup_table={}",
        inserted,
        backup_name
    );
    Ok(())
}

/// Read every row of a table into name -> value maps (legacy schemas have
/// unknown column sets, so typed mapping is not available here).
fn read_generic_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
) -> Result<Vec<std::collections::HashMap<String, rusqlite::types::Value>>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table}"))?;
    let column_names: Vec<String> = columns.to_vec();
    let rows = stmt
        .query_map([], |row| {
            let mut map = std::collections::HashMap::new();
            for (idx, name) in column_names.iter().enumerate() {
                let value: rusqlite::types::Value = row.get(idx)?;
                map.insert(name.clone(), value);
            }
            Ok(map)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::Database)?;
    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("m.db");
        let conn = Connection::open(&db_path).unwrap();

        let first = apply_migrations(&conn, &db_path).unwrap();
        assert_eq!(first, LATEST_VERSION);
        assert_eq!(read_version(&db_path), LATEST_VERSION);

        // Re-running applies nothing.
        let second = apply_migrations(&conn, &db_path).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn version_file_is_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("m.db");
        let conn = Connection::open(&db_path).unwrap();
        apply_migrations(&conn, &db_path).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("schema_version.txt")).unwrap();
        assert_eq!(raw.trim(), LATEST_VERSION.to_string());
    }

    #[test]
    fn repair_rebuilds_legacy_memories_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("m.db");
        let conn = Connection::open(&db_path).unwrap();

        // A truly ancient schema without decay columns.
        conn.execute_batch(
            "CREATE TABLE memories (
                id TEXT PRIMARY KEY, content TEXT, level TEXT, category TEXT,
                importance_score REAL, confidence_score REAL, privacy TEXT, tags TEXT,
                source_llm TEXT, source_conversation_id TEXT, version INTEGER,
                status TEXT, created_at TEXT, updated_at TEXT, last_referenced_at TEXT,
                reference_count INTEGER, embedding BLOB
             );
             INSERT INTO memories VALUES (
                'm1', 'The user prefers tea over coffee in the morning.', 'semantic',
                'preferences', 0.5, 0.9, 'public', '[]', 'legacy', NULL, 1, 'active',
                '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z',
                0, NULL
             );",
        )
        .unwrap();

        apply_migrations(&conn, &db_path).unwrap();

        // Row survived the rebuild with defaulted decay fields.
        let (content, profile): (String, String) = conn
            .query_row(
                "SELECT content, decay_profile FROM memories WHERE id = 'm1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(content.starts_with("The user prefers tea"));
        assert_eq!(profile, "stable");

        // Backup table exists.
        let backups: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name LIKE 'memories_legacy_backup_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(backups, 1);
    }

    #[test]
    fn repair_skips_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("m.db");
        let conn = Connection::open(&db_path).unwrap();
        apply_migrations(&conn, &db_path).unwrap();

        // Running the repair directly against a current schema is a no-op.
        repair_memories_schema(&conn).unwrap();
        let backups: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name LIKE 'memories_legacy_backup_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(backups, 0);
    }
}
