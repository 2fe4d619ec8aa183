//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::commands::{
    query::QueryArgs, reconcile::ReconcileArgs, run::RunArgs, webhook::WebhookArgs,
};

#[derive(Parser, Debug)]
#[command(name = "shelfsync")]
#[command(about = "Shelfsync - rate-limit aware sync and cache layer for a catalog system of record", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Config file to use instead of .shelfsync/config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync layer: reconciliation, deferred jobs and maintenance
    Run(RunArgs),

    /// Reconcile the replica against upstream
    Reconcile(ReconcileArgs),

    /// Read one entity through the cache
    Get {
        /// Entity type, e.g. products
        entity_type: String,

        /// External id
        id: String,
    },

    /// List entities from the replica
    Query(QueryArgs),

    /// Webhook operations
    Webhook(WebhookArgs),

    /// Run one maintenance sweep
    Sweep,

    /// Print the effective configuration
    Config,
}
