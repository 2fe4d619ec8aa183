//! `webhook replay`: push a saved delivery through the ingestion pipeline.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::load_config;
use crate::application::SyncRuntime;
use crate::cli::output::{output, CommandOutput};
use crate::services::{sign, WebhookRequest, WebhookResponse};

#[derive(Args, Debug)]
pub struct WebhookArgs {
    #[command(subcommand)]
    pub command: WebhookCommands,
}

#[derive(Subcommand, Debug)]
pub enum WebhookCommands {
    /// Replay a delivery body from a file
    Replay {
        /// Topic, e.g. products/update
        #[arg(long)]
        topic: String,

        /// File holding the raw JSON body
        #[arg(long)]
        file: PathBuf,

        /// Delivery id; read from the body's event_id when omitted
        #[arg(long)]
        event_id: Option<String>,

        /// Signature as received; computed with the configured secret when omitted
        #[arg(long)]
        signature: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct ReplayOutput {
    #[serde(flatten)]
    pub response: WebhookResponse,
}

impl CommandOutput for ReplayOutput {
    fn to_human(&self) -> String {
        let outcome = self.response.outcome.map_or("-", |o| o.as_str());
        format!(
            "status {} ({}), outcome {}, correlation id {}",
            self.response.status, self.response.state, outcome, self.response.correlation_id
        )
    }
}

pub async fn execute(args: WebhookArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    match args.command {
        WebhookCommands::Replay {
            topic,
            file,
            event_id,
            signature,
        } => {
            let config = load_config(config_path)?;
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let signature = match (signature, config.webhook.secret.as_deref()) {
                (Some(sig), _) => sig,
                (None, Some(secret)) => sign(secret, &body)?,
                (None, None) => bail!("no --signature given and webhook.secret is not configured"),
            };

            let runtime = SyncRuntime::build(config).await?;
            let response = runtime
                .webhooks
                .handle(WebhookRequest {
                    event_id,
                    topic,
                    signature: Some(signature),
                    body,
                })
                .await;
            let failed = !response.is_success();
            let status = response.status;
            output(&ReplayOutput { response }, json);
            if failed {
                bail!("delivery was not acknowledged (status {status})");
            }
            Ok(())
        }
    }
}
