//! Application layer: assembles adapters and services into a running system.

pub mod runtime;

pub use runtime::SyncRuntime;
