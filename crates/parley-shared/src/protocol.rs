use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::message::Message;
use crate::reactions::Reactions;
use crate::types::{parse_timestamp, MessageId, MessageKind, OnlineUser};

/// Message payload as served by `GET /messages`, returned by `POST /messages`
/// and broadcast over the real-time channel.
///
/// Every field is optional on the wire; [`RemoteMessage::into_message`]
/// decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    #[serde(alias = "_id")]
    pub id: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_duration: Option<f64>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Reactions,
    /// Temporary id the sender attached; lets the author's own devices match
    /// the broadcast to their optimistic row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Echoed by some server versions; never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_own: Option<bool>,
}

impl RemoteMessage {
    /// Validate the payload and build a confirmed [`Message`], deriving
    /// ownership from `current_user` rather than from the payload.
    pub fn into_message(self, current_user: &str) -> Result<Message, PayloadError> {
        let id = self.id.ok_or(PayloadError::MissingField("id"))?;
        let author = self.username.ok_or(PayloadError::MissingField("username"))?;
        let created_raw = self
            .created_at
            .ok_or(PayloadError::MissingField("createdAt"))?;
        let created_at = parse_timestamp(&created_raw)?;

        let kind = match self.message_type.as_deref() {
            Some(t) => t.parse::<MessageKind>()?,
            None if self.audio_url.is_some() => MessageKind::Voice,
            None => MessageKind::Text,
        };

        match kind {
            MessageKind::Text if self.content.is_none() => {
                return Err(PayloadError::MissingField("content"));
            }
            MessageKind::Voice if self.audio_url.is_none() => {
                return Err(PayloadError::MissingField("audioUrl"));
            }
            _ => {}
        }

        let is_own = author == current_user;
        Ok(Message {
            id: MessageId(id),
            temp_id: self.client_id.map(MessageId).filter(MessageId::is_temporary),
            author,
            body: self.content,
            audio_url: self.audio_url,
            audio_duration: self.audio_duration,
            kind,
            created_at,
            reply_to: self.reply_to.map(MessageId),
            reactions: self.reactions,
            is_own,
            pending: false,
            synced: true,
        })
    }
}

impl From<&Message> for RemoteMessage {
    fn from(m: &Message) -> Self {
        Self {
            id: Some(m.id.0.clone()),
            username: Some(m.author.clone()),
            content: m.body.clone(),
            message_type: Some(m.kind.as_str().to_string()),
            audio_url: m.audio_url.clone(),
            audio_duration: m.audio_duration,
            created_at: Some(m.created_at.to_rfc3339()),
            reply_to: m.reply_to.as_ref().map(|r| r.0.clone()),
            reactions: m.reactions.clone(),
            client_id: m.temp_id.as_ref().map(|t| t.0.clone()),
            is_own: None,
        }
    }
}

/// Body of `POST /messages` for text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendTextRequest {
    pub content: String,
    pub username: String,
    pub message_type: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Temporary id, lets the server recognise a replayed send.
    pub client_id: String,
}

impl SendTextRequest {
    pub fn from_message(m: &Message) -> Self {
        Self {
            content: m.body.clone().unwrap_or_default(),
            username: m.author.clone(),
            message_type: MessageKind::Text,
            reply_to: m.reply_to.as_ref().map(|r| r.0.clone()),
            client_id: m.temp_id.as_ref().unwrap_or(&m.id).0.clone(),
        }
    }
}

/// Fields of the multipart `POST /messages` for voice. The audio bytes are
/// read from `audio_path` at upload time.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceUpload {
    pub username: String,
    pub audio_path: String,
    pub duration: f64,
    pub reply_to: Option<String>,
    pub client_id: String,
}

impl VoiceUpload {
    pub fn from_message(m: &Message) -> Result<Self, PayloadError> {
        let audio_path = m
            .audio_url
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(PayloadError::MissingField("audioUrl"))?;
        Ok(Self {
            username: m.author.clone(),
            audio_path,
            duration: m.audio_duration.unwrap_or_default(),
            reply_to: m.reply_to.as_ref().map(|r| r.0.clone()),
            client_id: m.temp_id.as_ref().unwrap_or(&m.id).0.clone(),
        })
    }
}

/// Body of `POST /messages/reaction`, also the payload stored in the sync
/// queue for `REACTION` items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub message_id: String,
    pub emoji: String,
    pub username: String,
}

/// `messagesCleanup` directive: the server purged everything older than
/// `cutoff_date`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupDirective {
    #[serde(default)]
    pub deleted_count: u64,
    pub cutoff_date: String,
}

impl CleanupDirective {
    pub fn cutoff(&self) -> Result<DateTime<Utc>, PayloadError> {
        parse_timestamp(&self.cutoff_date)
    }
}

/// Events pushed by the server over the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage(RemoteMessage),
    MessageUpdated(RemoteMessage),
    OnlineUsers(Vec<OnlineUser>),
    MessagesCleanup(CleanupDirective),
}

/// Events emitted by the client over the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinChat {
        username: String,
        badge: serde_json::Value,
        current_streak: i64,
    },
    #[serde(rename_all = "camelCase")]
    UpdateBadge {
        badge: serde_json::Value,
        current_streak: i64,
    },
}

impl ServerEvent {
    pub fn from_json(text: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "newMessage",
            Self::MessageUpdated(_) => "messageUpdated",
            Self::OnlineUsers(_) => "onlineUsers",
            Self::MessagesCleanup(_) => "messagesCleanup",
        }
    }
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }
}
