//! `config` command: print the merged configuration with secrets redacted.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use super::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

const REDACTED: &str = "***";

#[derive(Debug, Serialize)]
pub struct ConfigOutput {
    #[serde(flatten)]
    pub config: Config,
}

impl ConfigOutput {
    pub fn redacted(mut config: Config) -> Self {
        if config.webhook.secret.is_some() {
            config.webhook.secret = Some(REDACTED.to_string());
        }
        if config.upstream.access_token.is_some() {
            config.upstream.access_token = Some(REDACTED.to_string());
        }
        Self { config }
    }
}

impl CommandOutput for ConfigOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_default()
    }
}

pub fn execute(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    output(&ConfigOutput::redacted(config), json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let mut config = Config::default();
        config.webhook.secret = Some("whsec_live".to_string());
        config.upstream.access_token = Some("shpat_123".to_string());

        let shown = ConfigOutput::redacted(config).to_human();
        assert!(!shown.contains("whsec_live"));
        assert!(!shown.contains("shpat_123"));
        assert!(shown.contains(REDACTED));
    }
}
