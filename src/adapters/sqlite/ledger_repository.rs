//! SQLite implementation of the IdempotencyLedger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{parse_datetime, parse_entity_type, parse_optional_datetime};
use crate::domain::errors::SyncResult;
use crate::domain::models::{format_timestamp, ProcessedWebhookRecord};
use crate::domain::ports::IdempotencyLedger;

#[derive(Clone)]
pub struct SqliteLedgerRepository {
    pool: SqlitePool,
}

impl SqliteLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    event_id: String,
    entity_type: String,
    external_id: String,
    topic: String,
    outcome: String,
    processed_at: String,
}

#[async_trait]
impl IdempotencyLedger for SqliteLedgerRepository {
    async fn get(&self, event_id: &str) -> SyncResult<Option<ProcessedWebhookRecord>> {
        let row: Option<LedgerRow> = sqlx::query_as(
            "SELECT event_id, entity_type, external_id, topic, outcome, processed_at FROM processed_webhooks WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(ProcessedWebhookRecord {
                event_id: r.event_id,
                entity_type: parse_entity_type(r.entity_type)?,
                external_id: r.external_id,
                topic: r.topic,
                outcome: r.outcome,
                processed_at: parse_datetime(&r.processed_at)?,
            })
        })
        .transpose()
    }

    async fn latest_processed_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let latest: Option<String> = sqlx::query_scalar("SELECT MAX(processed_at) FROM processed_webhooks")
            .fetch_one(&self.pool)
            .await?;
        parse_optional_datetime(latest)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM processed_webhooks WHERE processed_at < ?")
            .bind(format_timestamp(&older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteReplicaRepository};
    use crate::domain::models::{ApplyOutcome, EntityType, WebhookAction, WebhookEvent};
    use crate::domain::ports::ReplicaStore;
    use serde_json::json;

    fn event(id: &str, version: u64) -> WebhookEvent {
        WebhookEvent {
            event_id: id.to_string(),
            topic: "products/update".to_string(),
            entity_type: EntityType::new("products").unwrap(),
            action: WebhookAction::Upsert,
            external_id: "E1".to_string(),
            version,
            payload: json!({"id": "E1", "version": version}),
        }
    }

    #[tokio::test]
    async fn test_ledger_records_outcome_and_prunes() {
        let pool = create_migrated_test_pool().await.unwrap();
        let replica = SqliteReplicaRepository::new(pool.clone());
        let ledger = SqliteLedgerRepository::new(pool);

        assert!(ledger.latest_processed_at().await.unwrap().is_none());

        assert_eq!(replica.apply_event(&event("evt-1", 2)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            replica.apply_event(&event("evt-2", 1)).await.unwrap(),
            ApplyOutcome::Stale { stored_version: 2 }
        );

        let first = ledger.get("evt-1").await.unwrap().unwrap();
        assert_eq!(first.outcome, "applied");
        assert_eq!(ledger.get("evt-2").await.unwrap().unwrap().outcome, "stale");
        assert!(ledger.get("evt-3").await.unwrap().is_none());
        assert!(ledger.latest_processed_at().await.unwrap().is_some());

        let pruned = ledger.prune(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(pruned, 2);
        assert!(ledger.get("evt-1").await.unwrap().is_none());
    }
}
