//! # parley-store
//!
//! Durable local storage for the Parley sync engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] that wraps a
//! `rusqlite::Connection` with typed helpers for messages, the sync queue and
//! the last-sync marker, plus [`LocalStore`], the cloneable async handle every
//! other component goes through.

pub mod database;
pub mod handle;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sync_queue;
pub mod sync_state;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use handle::LocalStore;
pub use models::*;
