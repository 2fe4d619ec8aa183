//! CLI command implementations.

pub mod config;
pub mod query;
pub mod reconcile;
pub mod run;
pub mod sweep;
pub mod webhook;

use anyhow::Result;
use std::path::Path;

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

/// Load from `path` when given, otherwise from the project directory.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}
