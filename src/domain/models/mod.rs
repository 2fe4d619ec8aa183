//! Domain models for the synchronization layer.

pub mod checkpoint;
pub mod config;
pub mod entity;
pub mod freshness;
pub mod job;
pub mod query;
pub mod webhook;

pub use checkpoint::{CheckpointStatus, SyncCheckpoint};
pub use config::{
    ApiSurface, CacheConfig, Config, DatabaseConfig, GovernorConfig, GovernorSettings,
    LoggingConfig, MaintenanceConfig, ReconciliationConfig, RetryConfig, UpstreamConfig,
    WebhookConfig,
};
pub use entity::{EntityType, ReplicaEntity, UpstreamPage, UpstreamRecord, VersionSource};
pub use freshness::{DataSource, Fresh, Staleness};
pub use job::{ChangeNotice, DeferredJob};
pub use query::{
    FieldFilter, FilterOp, PageCursor, ReplicaPage, ReplicaQuery, SortDirection, SortKey,
    SortSpec, MAX_PAGE_SIZE,
};
pub use webhook::{ApplyOutcome, ProcessedWebhookRecord, WebhookAction, WebhookEvent, WebhookState};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
