use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{decode_ts, encode_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageId, MessageKind, MessagePatch, Reactions};

const SELECT_COLUMNS: &str = "SELECT id, temp_id, author, body, audio_url, kind, created_at,
        reactions, is_own, pending, synced, reply_to, audio_duration
     FROM messages";

const UPSERT_SQL: &str = "INSERT INTO messages
        (id, temp_id, author, body, audio_url, kind, created_at, reactions,
         is_own, pending, synced, reply_to, audio_duration)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
     ON CONFLICT(id) DO UPDATE SET
        temp_id        = COALESCE(excluded.temp_id, messages.temp_id),
        author         = excluded.author,
        body           = excluded.body,
        audio_url      = excluded.audio_url,
        kind           = excluded.kind,
        created_at     = excluded.created_at,
        reactions      = excluded.reactions,
        is_own         = excluded.is_own,
        pending        = excluded.pending,
        synced         = excluded.synced,
        reply_to       = excluded.reply_to,
        audio_duration = excluded.audio_duration";

impl Database {
    /// Insert or fully overwrite the row keyed by `message.id`.
    ///
    /// The delivery flags are taken from `pending` (`synced` is its negation),
    /// never from the struct, so a stored row is always one or the other.
    pub fn save_message(&self, message: &Message, pending: bool) -> Result<()> {
        upsert(self.conn(), message, pending)
    }

    /// Every message, oldest first.
    pub fn get_all_messages(&self) -> Result<Vec<Message>> {
        self.query_messages(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC, rowid ASC"))
    }

    /// Messages still waiting for server confirmation, oldest first.
    pub fn get_pending_messages(&self) -> Result<Vec<Message>> {
        self.query_messages(&format!(
            "{SELECT_COLUMNS} WHERE pending = 1 ORDER BY created_at ASC, rowid ASC"
        ))
    }

    /// Look a message up by its permanent or temporary identifier.
    pub fn get_message_by_id(&self, id: &MessageId) -> Result<Message> {
        self.find_message(id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let found = self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1 OR temp_id = ?1 ORDER BY id = ?1 DESC LIMIT 1"),
                params![id.as_str()],
                row_to_message,
            )
            .optional()?;
        Ok(found)
    }

    /// Apply a partial update and return the resulting row.
    pub fn update_message(&self, id: &MessageId, patch: &MessagePatch) -> Result<Message> {
        let tx = self.conn().unchecked_transaction()?;

        let mut message = locked_row(&tx, id)?;

        if let Some(reactions) = &patch.reactions {
            message.reactions = reactions.clone();
        }
        if let Some(pending) = patch.pending {
            message.pending = pending;
            message.synced = !pending;
        }

        write_state(&tx, &message)?;
        tx.commit()?;

        Ok(message)
    }

    /// Toggle `user`'s `emoji` on a message as one read-modify-write, so a
    /// concurrent reaction update cannot slip in between.
    pub fn toggle_reaction(&self, id: &MessageId, emoji: &str, user: &str) -> Result<Message> {
        let tx = self.conn().unchecked_transaction()?;

        let mut message = locked_row(&tx, id)?;
        message.reactions.toggle(emoji, user);

        write_state(&tx, &message)?;
        tx.commit()?;

        Ok(message)
    }

    /// Retire the temporary identifier `old_id` and install the confirmed row.
    ///
    /// Runs as one transaction: readers see either the old row or the new
    /// one, never both. The new row remembers `old_id` in `temp_id`.
    pub fn replace_identity(&self, old_id: &MessageId, confirmed: &Message) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        let removed = tx.execute("DELETE FROM messages WHERE id = ?1", params![old_id.as_str()])?;

        let mut row = confirmed.clone();
        if row.id != *old_id {
            row.temp_id = Some(old_id.clone());
        }
        upsert(&tx, &row, false)?;
        tx.commit()?;

        tracing::debug!(
            old_id = %old_id,
            new_id = %confirmed.id,
            replaced = removed > 0,
            "replaced message identity"
        );
        Ok(())
    }

    /// Delete every message created strictly before `cutoff`.
    pub fn delete_messages_older_than(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE created_at < ?1",
            params![encode_ts(cutoff)],
        )?;
        Ok(affected)
    }

    /// Retention trim: like [`delete_messages_older_than`](Self::delete_messages_older_than)
    /// but never drops a message that still waits to be sent.
    pub fn delete_expired_messages(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE created_at < ?1 AND pending = 0",
            params![encode_ts(cutoff)],
        )?;
        Ok(affected)
    }

    pub fn message_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn query_messages(&self, sql: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map([], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn locked_row(tx: &rusqlite::Transaction<'_>, id: &MessageId) -> Result<Message> {
    tx.query_row(
        &format!("{SELECT_COLUMNS} WHERE id = ?1 OR temp_id = ?1 ORDER BY id = ?1 DESC LIMIT 1"),
        params![id.as_str()],
        row_to_message,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    })
}

fn write_state(tx: &rusqlite::Transaction<'_>, message: &Message) -> Result<()> {
    tx.execute(
        "UPDATE messages SET reactions = ?2, pending = ?3, synced = ?4 WHERE id = ?1",
        params![
            message.id.as_str(),
            message.reactions.to_json(),
            message.pending,
            message.synced,
        ],
    )?;
    Ok(())
}

fn upsert(conn: &rusqlite::Connection, message: &Message, pending: bool) -> Result<()> {
    conn.execute(
        UPSERT_SQL,
        params![
            message.id.as_str(),
            message.temp_id.as_ref().map(|t| t.as_str()),
            message.author,
            message.body,
            message.audio_url,
            message.kind.as_str(),
            encode_ts(&message.created_at),
            message.reactions.to_json(),
            message.is_own,
            pending,
            !pending,
            message.reply_to.as_ref().map(|r| r.as_str()),
            message.audio_duration,
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let temp_id: Option<String> = row.get(1)?;
    let kind_str: String = row.get(5)?;
    let ts_str: String = row.get(6)?;
    let reactions_json: String = row.get(7)?;
    let reply_to: Option<String> = row.get(11)?;

    let kind = kind_str.parse::<MessageKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at = decode_ts(6, &ts_str)?;
    let reactions = Reactions::from_json(&reactions_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id: MessageId(id),
        temp_id: temp_id.map(MessageId),
        author: row.get(2)?,
        body: row.get(3)?,
        audio_url: row.get(4)?,
        audio_duration: row.get(12)?,
        kind,
        created_at,
        reply_to: reply_to.map(MessageId),
        reactions,
        is_own: row.get(8)?,
        pending: row.get(9)?,
        synced: row.get(10)?,
    })
}
