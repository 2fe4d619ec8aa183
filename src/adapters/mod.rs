//! Infrastructure adapters for external systems.

pub mod cache;
pub mod sqlite;
pub mod upstream;
