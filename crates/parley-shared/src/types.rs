use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::TEMP_ID_PREFIX;
use crate::error::PayloadError;

/// Message identifier: either server-issued (permanent) or a locally issued
/// `temp_<uuid>` placeholder that lives until the server confirms the send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Issue a fresh temporary identifier.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
        }
    }
}

impl FromStr for MessageKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "voice" | "audio" => Ok(Self::Voice),
            other => Err(PayloadError::UnknownKind(other.to_string())),
        }
    }
}

/// Presence metadata announced when joining the chat. Badge and streak are
/// owned by feature modules outside the engine and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default)]
    pub badge: serde_json::Value,
    #[serde(default)]
    pub current_streak: i64,
}

/// One entry of the server's `onlineUsers` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub username: String,
    #[serde(default)]
    pub badge: serde_json::Value,
    #[serde(default)]
    pub current_streak: i64,
}

/// Parse a server timestamp. Accepts RFC 3339 and bare `YYYY-MM-DD` dates
/// (interpreted as midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PayloadError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| PayloadError::InvalidTimestamp {
            value: value.to_string(),
            reason: "expected RFC 3339 or YYYY-MM-DD".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_recognised() {
        let id = MessageId::temporary();
        assert!(id.is_temporary());
        assert!(!MessageId::from("65f1c0ffee").is_temporary());
        assert_ne!(id, MessageId::temporary());
    }

    #[test]
    fn parses_rfc3339_and_plain_dates() {
        let ts = parse_timestamp("2024-03-01T10:15:00.250Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:15:00.250+00:00");

        let day = parse_timestamp("2024-01-01").unwrap();
        assert_eq!(day.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(PayloadError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn message_kind_accepts_audio_alias() {
        assert_eq!("audio".parse::<MessageKind>().unwrap(), MessageKind::Voice);
        assert!("sticker".parse::<MessageKind>().is_err());
    }
}
