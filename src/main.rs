//! Shelfsync CLI entry point.

use clap::Parser;

use shelfsync::cli::commands::{self, load_config};
use shelfsync::cli::{Cli, Commands};
use shelfsync::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // A broken config is reported by the command itself; log with defaults meanwhile.
    let log_config = load_config(config_path)
        .map(|c| LogConfig::from(&c.logging))
        .unwrap_or_default();
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => Some(logger),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, config_path, cli.json).await,
        Commands::Reconcile(args) => commands::reconcile::execute(args, config_path, cli.json).await,
        Commands::Get { entity_type, id } => {
            commands::query::execute_get(&entity_type, &id, config_path, cli.json).await
        }
        Commands::Query(args) => commands::query::execute_query(args, config_path, cli.json).await,
        Commands::Webhook(args) => commands::webhook::execute(args, config_path, cli.json).await,
        Commands::Sweep => commands::sweep::execute(config_path, cli.json).await,
        Commands::Config => commands::config::execute(config_path, cli.json),
    };

    if let Err(err) = result {
        shelfsync::cli::handle_error(err, cli.json);
    }
}
