//! SQLite implementation of the deferred job outbox.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{parse_datetime, parse_entity_type, version_from_sql};
use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::models::{format_timestamp, DeferredJob, WebhookAction};
use crate::domain::ports::JobQueue;

pub(crate) fn action_to_string(action: WebhookAction) -> &'static str {
    match action {
        WebhookAction::Upsert => "upsert",
        WebhookAction::Delete => "delete",
    }
}

fn parse_action(s: &str) -> SyncResult<WebhookAction> {
    match s {
        "upsert" => Ok(WebhookAction::Upsert),
        "delete" => Ok(WebhookAction::Delete),
        other => Err(SyncError::Serialization(format!("unknown job action '{other}'"))),
    }
}

#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn finish(&self, id: i64, status: &str, error: Option<&str>) -> SyncResult<()> {
        sqlx::query(
            "UPDATE deferred_jobs SET status = ?, last_error = COALESCE(?, last_error), finished_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(format_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    event_id: String,
    entity_type: String,
    external_id: String,
    action: String,
    version: i64,
    attempts: i64,
    last_error: Option<String>,
    run_after: String,
    created_at: String,
}

impl JobRow {
    fn into_job(self) -> SyncResult<DeferredJob> {
        Ok(DeferredJob {
            id: self.id,
            event_id: self.event_id,
            entity_type: parse_entity_type(self.entity_type)?,
            external_id: self.external_id,
            action: parse_action(&self.action)?,
            version: version_from_sql(self.version)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            last_error: self.last_error,
            run_after: parse_datetime(&self.run_after)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

#[async_trait]
impl JobQueue for SqliteJobRepository {
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> SyncResult<Vec<DeferredJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"SELECT id, event_id, entity_type, external_id, action, version, attempts, last_error, run_after, created_at
               FROM deferred_jobs
               WHERE status = 'pending' AND run_after <= ?
               ORDER BY run_after ASC, id ASC
               LIMIT ?"#,
        )
        .bind(format_timestamp(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn complete(&self, id: i64) -> SyncResult<()> {
        self.finish(id, "done", None).await
    }

    async fn reschedule(&self, id: i64, error: &str, run_after: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query("UPDATE deferred_jobs SET attempts = attempts + 1, last_error = ?, run_after = ? WHERE id = ?")
            .bind(error)
            .bind(format_timestamp(&run_after))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon(&self, id: i64, error: &str) -> SyncResult<()> {
        self.finish(id, "abandoned", Some(error)).await
    }

    async fn pending_count(&self) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deferred_jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteReplicaRepository};
    use crate::domain::models::{EntityType, WebhookEvent};
    use crate::domain::ports::ReplicaStore;
    use serde_json::json;

    async fn seeded() -> (SqliteJobRepository, SqliteReplicaRepository) {
        let pool = create_migrated_test_pool().await.unwrap();
        (SqliteJobRepository::new(pool.clone()), SqliteReplicaRepository::new(pool))
    }

    fn event(id: &str, external_id: &str, version: u64, action: WebhookAction) -> WebhookEvent {
        WebhookEvent {
            event_id: id.to_string(),
            topic: "products/update".to_string(),
            entity_type: EntityType::new("products").unwrap(),
            action,
            external_id: external_id.to_string(),
            version,
            payload: json!({"id": external_id, "version": version}),
        }
    }

    #[tokio::test]
    async fn test_only_applied_events_enqueue_jobs() {
        let (jobs, replica) = seeded().await;

        replica.apply_event(&event("e1", "A", 5, WebhookAction::Upsert)).await.unwrap();
        replica.apply_event(&event("e1", "A", 5, WebhookAction::Upsert)).await.unwrap();
        replica.apply_event(&event("e2", "A", 4, WebhookAction::Upsert)).await.unwrap();
        replica.apply_event(&event("e3", "A", 6, WebhookAction::Delete)).await.unwrap();

        let due = jobs.due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].event_id, "e1");
        assert_eq!(due[1].action, WebhookAction::Delete);
        assert_eq!(jobs.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reschedule_complete_abandon() {
        let (jobs, replica) = seeded().await;
        replica.apply_event(&event("e1", "A", 1, WebhookAction::Upsert)).await.unwrap();
        replica.apply_event(&event("e2", "B", 1, WebhookAction::Upsert)).await.unwrap();

        let due = jobs.due(Utc::now(), 10).await.unwrap();
        let (first, second) = (due[0].id, due[1].id);

        jobs.reschedule(first, "subscriber lagging", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let due = jobs.due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, second);

        jobs.complete(second).await.unwrap();
        jobs.abandon(first, "gave up").await.unwrap();
        assert_eq!(jobs.pending_count().await.unwrap(), 0);
        assert!(jobs.due(Utc::now() + chrono::Duration::hours(2), 10).await.unwrap().is_empty());
    }
}
