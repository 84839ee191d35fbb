use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reactions::Reactions;
use crate::types::{MessageId, MessageKind};

/// A chat message as held by the engine.
///
/// Delivery state is carried by two flags. A freshly created message has both
/// cleared (optimistic, only in memory); once persisted exactly one of them is
/// set: `pending` while the server has not accepted it, `synced` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Primary identifier: temporary until confirmed, then server-issued.
    pub id: MessageId,
    /// The temporary identifier this message was created under, kept after
    /// confirmation so optimistic references still resolve.
    pub temp_id: Option<MessageId>,
    pub author: String,
    pub body: Option<String>,
    /// Local path before upload, server URL afterwards.
    pub audio_url: Option<String>,
    /// Audio length in seconds.
    pub audio_duration: Option<f64>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    pub reactions: Reactions,
    pub is_own: bool,
    pub pending: bool,
    pub synced: bool,
}

impl Message {
    /// Build an optimistic text message authored by `author`.
    pub fn new_text(author: &str, body: &str, reply_to: Option<MessageId>) -> Self {
        Self {
            id: MessageId::temporary(),
            temp_id: None,
            author: author.to_string(),
            body: Some(body.to_string()),
            audio_url: None,
            audio_duration: None,
            kind: MessageKind::Text,
            created_at: Utc::now(),
            reply_to,
            reactions: Reactions::new(),
            is_own: true,
            pending: false,
            synced: false,
        }
    }

    /// Build an optimistic voice message referencing a local audio file.
    pub fn new_voice(
        author: &str,
        audio_ref: &str,
        duration: f64,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            body: None,
            audio_url: Some(audio_ref.to_string()),
            audio_duration: Some(duration),
            kind: MessageKind::Voice,
            ..Self::new_text(author, "", reply_to)
        }
    }

    /// Recompute `is_own` from the author handle.
    pub fn derive_ownership(&mut self, current_user: &str) {
        self.is_own = self.author == current_user;
    }

    pub fn with_ownership(mut self, current_user: &str) -> Self {
        self.derive_ownership(current_user);
        self
    }

    /// Shown to the user but neither queued nor confirmed yet.
    pub fn is_optimistic(&self) -> bool {
        !self.pending && !self.synced
    }

    /// True when `id` names this message by either identifier.
    pub fn answers_to(&self, id: &MessageId) -> bool {
        &self.id == id || self.temp_id.as_ref() == Some(id)
    }
}
