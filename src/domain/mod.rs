//! Domain layer for shelfsync
//!
//! Entities, value types and port traits. Nothing here talks to SQLite,
//! HTTP or the cache directly.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{SyncError, SyncResult};
