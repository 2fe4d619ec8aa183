//! `reconcile` command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::load_config;
use crate::application::SyncRuntime;
use crate::cli::output::progress::{create_spinner, ProgressBarExt};
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{EntityType, SyncCheckpoint};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Entity type; every configured type when omitted
    pub entity_type: Option<String>,

    /// Ignore a saved checkpoint and start from the first page
    #[arg(long)]
    pub restart: bool,
}

#[derive(Debug, Serialize)]
pub struct ReconcileOutput {
    pub checkpoints: Vec<SyncCheckpoint>,
}

impl CommandOutput for ReconcileOutput {
    fn to_human(&self) -> String {
        self.checkpoints
            .iter()
            .map(|c| {
                format!(
                    "{}: {} page(s), {} applied, {} already current",
                    c.entity_type, c.pages_synced, c.records_applied, c.records_stale
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub async fn execute(args: ReconcileArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let runtime = SyncRuntime::build(load_config(config_path)?).await?;

    let spinner = create_spinner("reconciling", json);
    let progress = spinner.clone();
    let job = runtime.reconciliation().with_progress(Arc::new(move |c: &SyncCheckpoint| {
        progress.set_message(format!(
            "{}: page {} ({} applied, {} current)",
            c.entity_type, c.pages_synced, c.records_applied, c.records_stale
        ));
    }));

    let entity_types = match args.entity_type {
        Some(name) => vec![EntityType::new(name)?],
        None => job.entity_types(),
    };

    let mut checkpoints = Vec::new();
    for entity_type in &entity_types {
        match job.run(entity_type, args.restart).await {
            Ok(checkpoint) => checkpoints.push(checkpoint),
            Err(e) => {
                spinner.finish_error(format!("{entity_type}: {e}"));
                return Err(e.into());
            }
        }
    }
    spinner.finish_success("reconciliation complete");

    output(&ReconcileOutput { checkpoints }, json);
    Ok(())
}
