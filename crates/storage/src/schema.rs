use rusqlite::Connection;

use crate::error::CacheError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS entities (
    local_id BLOB PRIMARY KEY CHECK (length(local_id) = 16),
    remote_id TEXT UNIQUE,
    kind TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    parent_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    sync_state TEXT NOT NULL CHECK (sync_state IN ('synced', 'pending_create', 'pending_update', 'pending_delete')),
    updated_at INTEGER NOT NULL,
    sync_error TEXT,
    retry_after INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 1,
    CHECK ((remote_id IS NULL) = (sync_state = 'pending_create'))
);
CREATE INDEX IF NOT EXISTS idx_entities_owner_parent ON entities (owner_id, parent_id);
CREATE INDEX IF NOT EXISTS idx_entities_pending ON entities (sync_state, retry_after) WHERE sync_state != 'synced';
";
