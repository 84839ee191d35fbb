//! Async, cloneable handle over one [`Database`].
//!
//! Every component reaches the store through this handle. Calls are
//! serialised on a single connection and each one is scoped to one row or one
//! transaction, so no caller ever observes a half-applied operation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::database::Database;
use crate::error::Result;
use crate::models::{Message, MessageId, MessagePatch, SyncAction, SyncQueueItem};

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    // -- messages ----------------------------------------------------------

    pub async fn save(&self, message: &Message, pending: bool) -> Result<()> {
        self.db.lock().await.save_message(message, pending)
    }

    pub async fn get_all(&self) -> Result<Vec<Message>> {
        self.db.lock().await.get_all_messages()
    }

    pub async fn get_pending(&self) -> Result<Vec<Message>> {
        self.db.lock().await.get_pending_messages()
    }

    pub async fn get_by_id(&self, id: &MessageId) -> Result<Option<Message>> {
        self.db.lock().await.find_message(id)
    }

    pub async fn update(&self, id: &MessageId, patch: &MessagePatch) -> Result<Message> {
        self.db.lock().await.update_message(id, patch)
    }

    pub async fn replace_identity(&self, old_id: &MessageId, confirmed: &Message) -> Result<()> {
        self.db.lock().await.replace_identity(old_id, confirmed)
    }

    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str, user: &str) -> Result<Message> {
        self.db.lock().await.toggle_reaction(id, emoji, user)
    }

    pub async fn delete_older_than(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        self.db.lock().await.delete_messages_older_than(cutoff)
    }

    /// Retention trim; pending messages are kept.
    pub async fn delete_expired(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        self.db.lock().await.delete_expired_messages(cutoff)
    }

    // -- sync queue --------------------------------------------------------

    pub async fn enqueue(
        &self,
        target_id: &MessageId,
        action: SyncAction,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        self.db.lock().await.enqueue(target_id, &action, payload)
    }

    /// Like [`enqueue`](Self::enqueue) with an explicit replay ceiling.
    pub async fn enqueue_with_limit(
        &self,
        target_id: &MessageId,
        action: SyncAction,
        payload: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<i64> {
        self.db
            .lock()
            .await
            .enqueue_with_limit(target_id, &action, payload, max_attempts)
    }

    pub async fn list_retryable(&self) -> Result<Vec<SyncQueueItem>> {
        self.db.lock().await.list_retryable()
    }

    pub async fn list_exhausted(&self) -> Result<Vec<SyncQueueItem>> {
        self.db.lock().await.list_exhausted()
    }

    pub async fn increment_attempts(&self, id: i64) -> Result<()> {
        self.db.lock().await.increment_attempts(id)
    }

    pub async fn remove(&self, id: i64) -> Result<bool> {
        self.db.lock().await.remove_queue_item(id)
    }

    // -- last-sync marker --------------------------------------------------

    pub async fn last_sync_marker(&self) -> Result<Option<DateTime<Utc>>> {
        self.db.lock().await.last_sync_marker()
    }

    pub async fn set_last_sync_marker(&self, at: &DateTime<Utc>) -> Result<()> {
        self.db.lock().await.set_last_sync_marker(at)
    }
}
