//! v002 -- Reply references, voice durations and identity lookups.

use rusqlite::Connection;

use super::add_column_if_missing;

const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_temp_id ON messages(temp_id);
CREATE INDEX IF NOT EXISTS idx_messages_pending ON messages(pending);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    add_column_if_missing(conn, "messages", "reply_to", "TEXT")?;
    add_column_if_missing(conn, "messages", "audio_duration", "REAL")?;
    conn.execute_batch(INDEX_SQL)
}
