//! Domain model structs persisted in the local SQLite database.
//!
//! Messages themselves are defined in `parley-shared` and re-exported here;
//! this module adds the store-only records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use parley_shared::{Message, MessageId, MessageKind, Reactions};

// ---------------------------------------------------------------------------
// Partial message update
// ---------------------------------------------------------------------------

/// Fields that may change on an existing message row. `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub reactions: Option<Reactions>,
    /// Setting `pending` also writes `synced = !pending`.
    pub pending: Option<bool>,
}

impl MessagePatch {
    pub fn reactions(reactions: Reactions) -> Self {
        Self {
            reactions: Some(reactions),
            ..Self::default()
        }
    }

    pub fn pending(pending: bool) -> Self {
        Self {
            pending: Some(pending),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Sync queue
// ---------------------------------------------------------------------------

/// Kind of outbound side-effect recorded in the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    Create,
    Reaction,
    /// Written by a newer build; left untouched by this one.
    Other(String),
}

impl SyncAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "CREATE",
            Self::Reaction => "REACTION",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for SyncAction {
    fn from(s: &str) -> Self {
        match s {
            "CREATE" => Self::Create,
            "REACTION" => Self::Reaction,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A durable record of one outbound operation awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub target_id: MessageId,
    pub action: SyncAction,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl SyncQueueItem {
    pub fn is_retryable(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
