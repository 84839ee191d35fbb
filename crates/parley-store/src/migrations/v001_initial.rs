//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `messages`, `sync_queue`, and the
//! single-row `sync_state`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,    -- server id, or temp_<uuid> until confirmed
    temp_id    TEXT,                         -- retired temporary id after confirmation
    author     TEXT NOT NULL,
    body       TEXT,
    audio_url  TEXT,
    kind       TEXT NOT NULL DEFAULT 'text', -- text | voice
    created_at TEXT NOT NULL,                -- RFC-3339, fixed width
    reactions  TEXT NOT NULL DEFAULT '{}',   -- JSON emoji -> [author]
    is_own     INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    pending    INTEGER NOT NULL DEFAULT 0,
    synced     INTEGER NOT NULL DEFAULT 0,

    CHECK (pending + synced = 1)
);

CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);

-- ----------------------------------------------------------------
-- Sync queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_queue (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id    TEXT NOT NULL,              -- message the side-effect applies to
    action       TEXT NOT NULL,              -- CREATE | REACTION
    payload      TEXT NOT NULL,              -- JSON
    created_at   TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3
);

-- ----------------------------------------------------------------
-- Last successful pull
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    last_sync_at TEXT
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
