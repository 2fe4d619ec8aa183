use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::{Config, EntityType, GovernorSettings};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid {surface} budget: capacity must be at least 1")]
    InvalidCapacity { surface: &'static str },

    #[error("Invalid {surface} budget: refill_per_sec {rate} must be positive")]
    InvalidRefillRate { surface: &'static str, rate: f64 },

    #[error("Invalid {surface} budget: {reason}")]
    InvalidBackoffFactor { surface: &'static str, reason: String },

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must not exceed max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid cache TTL: list_ttl_secs ({list}) must not exceed detail_ttl_secs ({detail})")]
    InvalidCacheTtl { list: u64, detail: u64 },

    #[error("Invalid entity type '{0}' in reconciliation.entity_types")]
    InvalidEntityType(String),

    #[error("Invalid page_size: {0}. Must be between 1 and 250")]
    InvalidPageSize(u32),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .shelfsync/config.yaml
    /// 3. .shelfsync/local.yaml (optional overrides)
    /// 4. Environment variables (SHELFSYNC_* prefix, `__` separates nesting)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Same as [`Self::load`], rooted at `dir` instead of the working directory.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let root = dir.as_ref().join(".shelfsync");
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(root.join("config.yaml")))
            .merge(Yaml::file(root.join("local.yaml")))
            .merge(Env::prefixed("SHELFSYNC_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honoring env overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("SHELFSYNC_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate_budget(surface: &'static str, budget: &GovernorSettings) -> Result<(), ConfigError> {
        if budget.capacity == 0 {
            return Err(ConfigError::InvalidCapacity { surface });
        }
        if budget.refill_per_sec <= 0.0 || !budget.refill_per_sec.is_finite() {
            return Err(ConfigError::InvalidRefillRate {
                surface,
                rate: budget.refill_per_sec,
            });
        }
        if !(budget.backoff_factor > 0.0 && budget.backoff_factor <= 1.0) {
            return Err(ConfigError::InvalidBackoffFactor {
                surface,
                reason: format!("backoff_factor {} must be in (0, 1]", budget.backoff_factor),
            });
        }
        if !(budget.min_rate_factor > 0.0 && budget.min_rate_factor <= 1.0) {
            return Err(ConfigError::InvalidBackoffFactor {
                surface,
                reason: format!("min_rate_factor {} must be in (0, 1]", budget.min_rate_factor),
            });
        }
        Ok(())
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Self::validate_budget("rest", &config.governor.rest)?;
        Self::validate_budget("graphql", &config.governor.graphql)?;

        if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        if config.cache.list_ttl_secs > config.cache.detail_ttl_secs {
            return Err(ConfigError::InvalidCacheTtl {
                list: config.cache.list_ttl_secs,
                detail: config.cache.detail_ttl_secs,
            });
        }

        for name in &config.reconciliation.entity_types {
            if EntityType::new(name.as_str()).is_err() {
                return Err(ConfigError::InvalidEntityType(name.clone()));
            }
        }
        if config.reconciliation.page_size == 0 || config.reconciliation.page_size > 250 {
            return Err(ConfigError::InvalidPageSize(config.reconciliation.page_size));
        }

        if config.webhook.id_field.is_empty() || config.upstream.id_field.is_empty() {
            return Err(ConfigError::ValidationFailed("id_field cannot be empty".to_string()));
        }
        if config.webhook.ack_budget_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "webhook.ack_budget_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
