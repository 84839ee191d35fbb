use serde::Serialize;
use tokio::sync::broadcast;

use parley_net::ChannelStatus;
use parley_shared::OnlineUser;

use crate::coordinator::SyncReport;

pub const EVENT_MESSAGES_CHANGED: &str = "messages-changed";
pub const EVENT_PRESENCE_CHANGED: &str = "presence-changed";
pub const EVENT_CHANNEL_STATUS: &str = "channel-status";
pub const EVENT_NOTICE: &str = "notice";
pub const EVENT_SYNC_COMPLETED: &str = "sync-completed";

/// Capacity of the session event bus. Slow subscribers skip ahead.
pub const EVENT_BUS_CAPACITY: usize = 128;

/// Everything a UI layer needs to react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The message list changed; re-read `ChatSession::messages()`.
    MessagesChanged,
    PresenceChanged(Vec<OnlineUser>),
    Channel(ChannelStatus),
    /// A user-facing notice, e.g. a forced sync while offline.
    Notice(NoticePayload),
    SyncCompleted(SyncReport),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessagesChanged => EVENT_MESSAGES_CHANGED,
            Self::PresenceChanged(_) => EVENT_PRESENCE_CHANGED,
            Self::Channel(_) => EVENT_CHANNEL_STATUS,
            Self::Notice(_) => EVENT_NOTICE,
            Self::SyncCompleted(_) => EVENT_SYNC_COMPLETED,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NoticePayload {
    pub message: String,
}

pub fn emit_event(bus: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    let name = event.name();
    // No subscribers is normal for a headless session.
    if bus.send(event).is_err() {
        tracing::trace!(event = name, "no event subscribers");
    }
}
