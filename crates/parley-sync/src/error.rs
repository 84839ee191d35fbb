use thiserror::Error;

use parley_net::{ChannelError, NetError};
use parley_shared::PayloadError;
use parley_store::StoreError;

/// Failure of a sync phase. Network errors abort only the phase they occur
/// in; store errors abort the whole cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

impl From<PayloadError> for SyncError {
    fn from(e: PayloadError) -> Self {
        Self::Net(NetError::Payload(e))
    }
}

/// Errors surfaced by the chat session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Audio reference is empty")]
    EmptyAudio,

    #[error("Sending too fast, try again in a moment")]
    Throttled,

    #[error("You are offline. Messages will sync when the connection returns")]
    Offline,

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),
}
