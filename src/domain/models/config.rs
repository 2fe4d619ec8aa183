use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::entity::VersionSource;

/// Main configuration structure for shelfsync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream rate budgets, one per API surface
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Retry policy for upstream calls made by a coalescing owner
    #[serde(default)]
    pub retry: RetryConfig,

    /// Cache TTLs and retention
    #[serde(default)]
    pub cache: CacheConfig,

    /// Webhook ingestion
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Bulk reconciliation
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Upstream API endpoint
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Background sweeps and deferred-job worker
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// How record versions are derived, shared by webhooks and upstream reads
    #[serde(default)]
    pub version_source: VersionSource,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            governor: GovernorConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            webhook: WebhookConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            upstream: UpstreamConfig::default(),
            maintenance: MaintenanceConfig::default(),
            version_source: VersionSource::default(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on the SQLite write lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long a caller waits for a free pooled connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_database_path() -> String {
    ".shelfsync/replica.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_acquire_timeout_ms() -> u64 {
    3_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rotated log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation policy for file logs: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Upstream API surface with its own, independent rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiSurface {
    #[default]
    Rest,
    #[serde(rename = "graphql")]
    GraphQl,
}

impl fmt::Display for ApiSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rest => "rest",
            Self::GraphQl => "graphql",
        })
    }
}

/// Per-surface token bucket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GovernorSettings {
    /// Bucket capacity (burst size) in tokens
    pub capacity: u32,

    /// Tokens added per second
    pub refill_per_sec: f64,

    /// Longest a caller may wait for tokens before `RateLimitTimeout`
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Waiting callers beyond this depth fail fast into the stale path
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Rate multiplier applied after an upstream rate-limit response
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Floor for the adaptive rate multiplier
    #[serde(default = "default_min_rate_factor")]
    pub min_rate_factor: f64,
}

const fn default_max_wait_ms() -> u64 {
    5_000
}

const fn default_max_queue_depth() -> usize {
    64
}

const fn default_backoff_factor() -> f64 {
    0.5
}

const fn default_min_rate_factor() -> f64 {
    0.125
}

impl GovernorSettings {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            max_wait_ms: default_max_wait_ms(),
            max_queue_depth: default_max_queue_depth(),
            backoff_factor: default_backoff_factor(),
            min_rate_factor: default_min_rate_factor(),
        }
    }

    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Rate budgets for each upstream surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GovernorConfig {
    #[serde(default = "default_rest_budget")]
    pub rest: GovernorSettings,

    #[serde(default = "default_graphql_budget")]
    pub graphql: GovernorSettings,
}

fn default_rest_budget() -> GovernorSettings {
    GovernorSettings::new(2, 2.0)
}

fn default_graphql_budget() -> GovernorSettings {
    GovernorSettings::new(10, 5.0)
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rest: default_rest_budget(),
            graphql: default_graphql_budget(),
        }
    }
}

impl GovernorConfig {
    pub fn for_surface(&self, surface: ApiSurface) -> &GovernorSettings {
        match surface {
            ApiSurface::Rest => &self.rest,
            ApiSurface::GraphQl => &self.graphql,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Cache TTLs. List results expire sooner than single-entity details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    #[serde(default = "default_detail_ttl_secs")]
    pub detail_ttl_secs: u64,

    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,

    /// How long an expired entry is retained for the serve-stale path
    #[serde(default = "default_stale_retention_secs")]
    pub stale_retention_secs: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

const fn default_detail_ttl_secs() -> u64 {
    600
}

const fn default_list_ttl_secs() -> u64 {
    300
}

const fn default_stale_retention_secs() -> u64 {
    3_600
}

const fn default_max_entries() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            detail_ttl_secs: default_detail_ttl_secs(),
            list_ttl_secs: default_list_ttl_secs(),
            stale_retention_secs: default_stale_retention_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_ttl_secs)
    }

    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }
}

/// Webhook ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WebhookConfig {
    /// Shared HMAC secret; deliveries are rejected while unset
    #[serde(default)]
    pub secret: Option<String>,

    /// Time allowed before a delivery is answered with a retryable failure
    #[serde(default = "default_ack_budget_ms")]
    pub ack_budget_ms: u64,

    /// Ledger retention; must cover upstream's maximum retry span
    #[serde(default = "default_ledger_retention_hours")]
    pub ledger_retention_hours: u64,

    /// Payload field carrying the external id
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

const fn default_ack_budget_ms() -> u64 {
    4_000
}

const fn default_ledger_retention_hours() -> u64 {
    72
}

fn default_id_field() -> String {
    "id".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ack_budget_ms: default_ack_budget_ms(),
            ledger_retention_hours: default_ledger_retention_hours(),
            id_field: default_id_field(),
        }
    }
}

impl WebhookConfig {
    pub fn ack_budget(&self) -> Duration {
        Duration::from_millis(self.ack_budget_ms)
    }

    pub fn ledger_retention(&self) -> Duration {
        Duration::from_secs(self.ledger_retention_hours * 3_600)
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconciliationConfig {
    /// Entity types kept in the replica
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Webhook silence longer than this triggers a reconciliation pass
    #[serde(default = "default_drift_threshold_secs")]
    pub drift_threshold_secs: u64,

    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_entity_types() -> Vec<String> {
    vec!["products".to_string(), "variants".to_string()]
}

const fn default_page_size() -> u32 {
    100
}

const fn default_drift_threshold_secs() -> u64 {
    3_600
}

const fn default_true() -> bool {
    true
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            entity_types: default_entity_types(),
            page_size: default_page_size(),
            drift_threshold_secs: default_drift_threshold_secs(),
            run_on_startup: default_true(),
        }
    }
}

impl ReconciliationConfig {
    pub fn drift_threshold(&self) -> Duration {
        Duration::from_secs(self.drift_threshold_secs)
    }
}

/// Upstream API endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Which rate budget reads are charged against
    #[serde(default)]
    pub surface: ApiSurface,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Record field carrying the external id
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_token_header() -> String {
    "X-Upstream-Access-Token".to_string()
}

const fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_token: None,
            token_header: default_token_header(),
            surface: ApiSurface::default(),
            timeout_ms: default_timeout_ms(),
            id_field: default_id_field(),
        }
    }
}

/// Maintenance daemon and deferred-job worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MaintenanceConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Tombstoned rows older than this are hard-deleted
    #[serde(default = "default_tombstone_retention_hours")]
    pub tombstone_retention_hours: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,

    #[serde(default = "default_job_batch_size")]
    pub job_batch_size: u32,
}

const fn default_interval_secs() -> u64 {
    300
}

const fn default_tombstone_retention_hours() -> u64 {
    168
}

const fn default_max_consecutive_failures() -> u32 {
    5
}

const fn default_job_poll_interval_ms() -> u64 {
    500
}

const fn default_job_batch_size() -> u32 {
    32
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            tombstone_retention_hours: default_tombstone_retention_hours(),
            max_consecutive_failures: default_max_consecutive_failures(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            job_batch_size: default_job_batch_size(),
        }
    }
}

impl MaintenanceConfig {
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_hours * 3_600)
    }
}
