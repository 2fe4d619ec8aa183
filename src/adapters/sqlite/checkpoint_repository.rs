//! SQLite implementation of the CheckpointRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{parse_datetime, parse_entity_type, parse_optional_datetime};
use crate::domain::errors::SyncResult;
use crate::domain::models::{format_timestamp, CheckpointStatus, EntityType, SyncCheckpoint};
use crate::domain::ports::CheckpointRepository;

#[derive(Clone)]
pub struct SqliteCheckpointRepository {
    pool: SqlitePool,
}

impl SqliteCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    entity_type: String,
    cursor: Option<String>,
    pages_synced: i64,
    records_applied: i64,
    records_stale: i64,
    status: String,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> SyncResult<SyncCheckpoint> {
        Ok(SyncCheckpoint {
            entity_type: parse_entity_type(self.entity_type)?,
            cursor: self.cursor,
            pages_synced: self.pages_synced.max(0) as u64,
            records_applied: self.records_applied.max(0) as u64,
            records_stale: self.records_stale.max(0) as u64,
            status: CheckpointStatus::parse(&self.status),
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: parse_optional_datetime(self.completed_at)?,
        })
    }
}

#[async_trait]
impl CheckpointRepository for SqliteCheckpointRepository {
    async fn load(&self, entity_type: &EntityType) -> SyncResult<Option<SyncCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as("SELECT * FROM sync_checkpoints WHERE entity_type = ?")
            .bind(entity_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn save(&self, checkpoint: &SyncCheckpoint) -> SyncResult<()> {
        sqlx::query(
            r#"INSERT INTO sync_checkpoints
               (entity_type, cursor, pages_synced, records_applied, records_stale, status, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (entity_type) DO UPDATE SET
                   cursor = excluded.cursor,
                   pages_synced = excluded.pages_synced,
                   records_applied = excluded.records_applied,
                   records_stale = excluded.records_stale,
                   status = excluded.status,
                   started_at = excluded.started_at,
                   updated_at = excluded.updated_at,
                   completed_at = excluded.completed_at"#,
        )
        .bind(checkpoint.entity_type.as_str())
        .bind(&checkpoint.cursor)
        .bind(checkpoint.pages_synced as i64)
        .bind(checkpoint.records_applied as i64)
        .bind(checkpoint.records_stale as i64)
        .bind(checkpoint.status.to_string())
        .bind(format_timestamp(&checkpoint.started_at))
        .bind(format_timestamp(&checkpoint.updated_at))
        .bind(checkpoint.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let repo = SqliteCheckpointRepository::new(create_migrated_test_pool().await.unwrap());
        let products = EntityType::new("products").unwrap();

        assert!(repo.load(&products).await.unwrap().is_none());

        let mut checkpoint = SyncCheckpoint::start(products.clone());
        checkpoint.cursor = Some("page-3".to_string());
        checkpoint.pages_synced = 2;
        checkpoint.records_applied = 150;
        repo.save(&checkpoint).await.unwrap();

        let loaded = repo.load(&products).await.unwrap().unwrap();
        assert_eq!(loaded.cursor.as_deref(), Some("page-3"));
        assert_eq!(loaded.pages_synced, 2);
        assert!(loaded.is_resumable());

        checkpoint.status = CheckpointStatus::Completed;
        checkpoint.cursor = None;
        checkpoint.completed_at = Some(chrono::Utc::now());
        repo.save(&checkpoint).await.unwrap();

        let loaded = repo.load(&products).await.unwrap().unwrap();
        assert_eq!(loaded.status, CheckpointStatus::Completed);
        assert!(loaded.cursor.is_none());
        assert!(loaded.completed_at.is_some());
    }
}
