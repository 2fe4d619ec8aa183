//! Infrastructure layer module
//!
//! Configuration loading and logging setup. Storage, cache and upstream
//! adapters live under `adapters`.

pub mod config;
pub mod logging;
