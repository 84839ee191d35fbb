//! Offline-first sync engine for the Parley chat client.
//!
//! [`ChatSession`] is the entry point: it owns the in-memory conversation,
//! writes through the local store and lets the [`SyncCoordinator`] reconcile
//! with the server in the background.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod session;
pub mod throttle;

#[cfg(test)]
mod testing;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::SyncConfig;
pub use coordinator::{Reconciled, SyncCoordinator, SyncPhase, SyncReport};
pub use error::{SessionError, SyncError};
pub use events::{NoticePayload, SessionEvent};
pub use session::ChatSession;
pub use throttle::Throttle;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_sync=debug,parley_net=debug,parley_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
