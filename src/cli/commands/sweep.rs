//! `sweep` command.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use super::load_config;
use crate::application::SyncRuntime;
use crate::cli::output::{output, CommandOutput};
use crate::services::{DrainReport, SweepReport};

#[derive(Debug, Serialize)]
pub struct SweepOutput {
    #[serde(flatten)]
    pub report: SweepReport,
    pub jobs_completed: u64,
    pub jobs_rescheduled: u64,
    pub jobs_pending: u64,
}

impl CommandOutput for SweepOutput {
    fn to_human(&self) -> String {
        [
            format!("Tombstones removed: {}", self.report.tombstones_removed),
            format!("Ledger records pruned: {}", self.report.ledger_pruned),
            format!("Cache index keys pruned: {}", self.report.index_keys_pruned),
            format!("Deferred jobs completed: {}", self.jobs_completed),
            format!("Deferred jobs rescheduled: {}", self.jobs_rescheduled),
            format!("Deferred jobs pending: {}", self.jobs_pending),
        ]
        .join("\n")
    }
}

pub async fn execute(config_path: Option<&Path>, json: bool) -> Result<()> {
    use crate::domain::ports::JobQueue;

    let runtime = SyncRuntime::build(load_config(config_path)?).await?;
    let report = runtime.maintenance().sweep().await?;
    let drained: DrainReport = runtime.job_worker().run_once().await?;
    let jobs_pending = runtime.jobs.pending_count().await?;

    output(
        &SweepOutput {
            report,
            jobs_completed: drained.completed,
            jobs_rescheduled: drained.rescheduled,
            jobs_pending,
        },
        json,
    );
    Ok(())
}
