//! SQLite adapters: replica, idempotency ledger, checkpoints and job outbox.

pub mod checkpoint_repository;
pub mod connection;
pub mod job_repository;
pub mod ledger_repository;
pub mod migrations;
pub mod replica_repository;

pub use checkpoint_repository::SqliteCheckpointRepository;
pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use job_repository::SqliteJobRepository;
pub use ledger_repository::SqliteLedgerRepository;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use replica_repository::SqliteReplicaRepository;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::models::EntityType;

/// Parse an RFC3339 datetime string from a SQLite row field.
pub fn parse_datetime(s: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map_err(|e| SyncError::Serialization(e.to_string()))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an optional RFC3339 datetime string from a SQLite row field.
pub fn parse_optional_datetime(s: Option<String>) -> SyncResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_datetime(&s)).transpose()
}

/// Parse a stored entity type column.
pub fn parse_entity_type(s: String) -> SyncResult<EntityType> {
    EntityType::new(s).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// SQLite stores versions as signed 64-bit integers.
pub fn version_to_sql(version: u64) -> SyncResult<i64> {
    i64::try_from(version).map_err(|_| SyncError::Validation(format!("version {version} out of range")))
}

pub fn version_from_sql(version: i64) -> SyncResult<u64> {
    u64::try_from(version).map_err(|_| SyncError::Serialization(format!("negative stored version {version}")))
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),
}

pub async fn initialize_database(database_url: &str, config: Option<PoolConfig>) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, config).await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}

/// Create an in-memory test pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}
