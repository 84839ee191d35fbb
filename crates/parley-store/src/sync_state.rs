use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{decode_ts, encode_ts, Database};
use crate::error::Result;

impl Database {
    /// Time of the last successful pull, `None` before the first one.
    pub fn last_sync_marker(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT last_sync_at FROM sync_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match raw.flatten() {
            Some(s) => Ok(Some(decode_ts(0, &s)?)),
            None => Ok(None),
        }
    }

    pub fn set_last_sync_marker(&self, at: &DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_state (id, last_sync_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_sync_at = excluded.last_sync_at",
            params![encode_ts(at)],
        )?;
        Ok(())
    }
}
