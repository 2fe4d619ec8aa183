pub mod commands;
pub mod output;
pub mod types;

pub use types::{Cli, Commands};

use crate::domain::errors::SyncError;

/// Print `err` and exit with a status that distinguishes retryable failures.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    let retryable = err.downcast_ref::<SyncError>().is_some_and(|e| {
        e.allows_stale_fallback() || matches!(e, SyncError::TemporarilyUnavailable { .. })
    });

    if json_mode {
        let body = serde_json::json!({
            "error": format!("{err:#}"),
            "retryable": retryable,
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(if retryable { 75 } else { 1 });
}
