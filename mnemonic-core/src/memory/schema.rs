//! SQLite schema and migrations for the cold store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL journal: a crash loses at most the last uncommitted write
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // NORMAL is durable in WAL mode except against power loss mid-checkpoint
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            embedding_ref TEXT,
            created_at TEXT NOT NULL,
            accessed_at TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            importance REAL NOT NULL DEFAULT 0.5,
            tier INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // Indexes backing ranked search and cleanup
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_accessed_at ON records(accessed_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_importance ON records(importance)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_access_count ON records(access_count)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_tier ON records(tier)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='records'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
