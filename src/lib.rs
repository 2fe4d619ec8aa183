//! Shelfsync - rate-limit aware sync and cache layer
//!
//! Shelfsync keeps a local replica of a remote catalog (the system of record)
//! converged through signed webhooks and periodic reconciliation, and serves
//! reads through a tag-invalidated cache that coalesces concurrent misses and
//! never exceeds the upstream API's rate budget.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Models, errors and port traits
//! - **Adapters** (`adapters`): SQLite repositories, the read cache and the HTTP upstream client
//! - **Service Layer** (`services`): Governor, coalescer, catalog reads, webhook ingestion,
//!   reconciliation, deferred jobs and maintenance
//! - **Application Layer** (`application`): Wiring of the above into a [`SyncRuntime`]
//! - **Infrastructure Layer** (`infrastructure`): Configuration and logging
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use shelfsync::{ConfigLoader, EntityType, SyncRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = SyncRuntime::build(ConfigLoader::load()?).await?;
//!     let product = runtime.catalog.get_entity(&EntityType::new("products")?, "42").await?;
//!     println!("{} ({:?})", product.value.external_id, product.staleness.source);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::SyncRuntime;
pub use domain::models::{
    ApplyOutcome, Config, DataSource, EntityType, Fresh, ReplicaEntity, ReplicaPage, ReplicaQuery, Staleness,
    SyncCheckpoint, VersionSource, WebhookEvent,
};
pub use domain::ports::{
    CheckpointRepository, IdempotencyLedger, JobQueue, ReplicaStore, UpstreamClient, UpstreamError,
};
pub use domain::{SyncError, SyncResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    GovernorSet, Priority, ReadCache, RequestCoalescer, SyncedCatalog, UpstreamGovernor, WebhookPipeline,
};
