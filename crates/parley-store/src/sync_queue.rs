use chrono::Utc;
use rusqlite::params;

use parley_shared::constants::DEFAULT_MAX_ATTEMPTS;

use crate::database::{decode_ts, encode_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{MessageId, SyncAction, SyncQueueItem};

impl Database {
    /// Record an outbound side-effect for later replay. Returns the item id.
    pub fn enqueue(
        &self,
        target_id: &MessageId,
        action: &SyncAction,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        self.enqueue_with_limit(target_id, action, payload, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn enqueue_with_limit(
        &self,
        target_id: &MessageId,
        action: &SyncAction,
        payload: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO sync_queue (target_id, action, payload, created_at, attempts, max_attempts)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                target_id.as_str(),
                action.as_str(),
                serde_json::to_string(payload)?,
                encode_ts(&Utc::now()),
                max_attempts,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Items that still have attempts left, oldest first.
    pub fn list_retryable(&self) -> Result<Vec<SyncQueueItem>> {
        self.query_queue(
            "SELECT id, target_id, action, payload, created_at, attempts, max_attempts
             FROM sync_queue WHERE attempts < max_attempts ORDER BY id ASC",
        )
    }

    /// Items that ran out of attempts and are no longer replayed.
    pub fn list_exhausted(&self) -> Result<Vec<SyncQueueItem>> {
        self.query_queue(
            "SELECT id, target_id, action, payload, created_at, attempts, max_attempts
             FROM sync_queue WHERE attempts >= max_attempts ORDER BY id ASC",
        )
    }

    pub fn increment_attempts(&self, id: i64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn remove_queue_item(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn query_queue(&self, sql: &str) -> Result<Vec<SyncQueueItem>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let target: String = row.get(1)?;
            let action: String = row.get(2)?;
            let payload_str: String = row.get(3)?;
            let ts_str: String = row.get(4)?;

            let payload = serde_json::from_str(&payload_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

            Ok(SyncQueueItem {
                id: row.get(0)?,
                target_id: MessageId(target),
                action: SyncAction::from(action.as_str()),
                payload,
                created_at: decode_ts(4, &ts_str)?,
                attempts: row.get(5)?,
                max_attempts: row.get(6)?,
            })
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}
