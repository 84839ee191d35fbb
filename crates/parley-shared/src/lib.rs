//! Types shared by every Parley crate: the message model, the reaction set,
//! and the wire protocol spoken with the chat server.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod reactions;
pub mod types;

pub use error::PayloadError;
pub use message::Message;
pub use reactions::{ReactionChange, Reactions};
pub use types::{MessageId, MessageKind, OnlineUser, Presence};
