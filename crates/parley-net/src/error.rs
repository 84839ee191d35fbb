use thiserror::Error;

use parley_shared::PayloadError;

/// Failures of a request against the REST message API.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Credential unavailable: {0}")]
    Credential(String),

    #[error("Audio file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl NetError {
    /// Failures a later retry may cure: timeouts, refused connections and
    /// non-success statuses.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_) | Self::Status(_))
    }
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Connect(e.to_string())
        }
    }
}

/// Failures of the real-time channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] NetError),

    #[error("Invalid frame: {0}")]
    Frame(#[from] PayloadError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Connection closed by server")]
    Closed,

    #[error("Channel not connected")]
    NotConnected,
}
