//! Bulk reconciliation of the replica against upstream.
//!
//! Walks the full upstream collection for one entity type at background
//! priority, so interactive reads keep their budget. Every record goes
//! through the same version gate as webhooks, which makes the job safe to
//! run while deliveries are arriving. Progress is checkpointed after each
//! page; an interrupted run picks up at the saved cursor.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::adapters::cache;
use crate::domain::errors::SyncResult;
use crate::domain::models::{ApplyOutcome, CheckpointStatus, EntityType, ReconciliationConfig, SyncCheckpoint};
use crate::domain::ports::{CheckpointRepository, IdempotencyLedger, ReplicaStore, UpstreamClient};
use crate::services::catalog::{fetch_with_retry, invalidate_entity, ReadCache};
use crate::services::governor::{Priority, UpstreamGovernor};
use crate::services::retry::RetryPolicy;

/// Called with the checkpoint after each page is saved.
pub type ProgressFn = Arc<dyn Fn(&SyncCheckpoint) + Send + Sync>;

pub struct ReconciliationJob {
    upstream: Arc<dyn UpstreamClient>,
    governor: Arc<UpstreamGovernor>,
    replica: Arc<dyn ReplicaStore>,
    checkpoints: Arc<dyn CheckpointRepository>,
    ledger: Arc<dyn IdempotencyLedger>,
    cache: Arc<ReadCache>,
    retry: RetryPolicy,
    config: ReconciliationConfig,
    progress: Option<ProgressFn>,
}

impl ReconciliationJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        governor: Arc<UpstreamGovernor>,
        replica: Arc<dyn ReplicaStore>,
        checkpoints: Arc<dyn CheckpointRepository>,
        ledger: Arc<dyn IdempotencyLedger>,
        cache: Arc<ReadCache>,
        retry: RetryPolicy,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            upstream,
            governor,
            replica,
            checkpoints,
            ledger,
            cache,
            retry,
            config,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Configured entity types, skipping invalid names.
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.config
            .entity_types
            .iter()
            .filter_map(|name| EntityType::new(name.as_str()).ok())
            .collect()
    }

    /// Whether `entity_type` is due for a pass.
    ///
    /// True until a pass has completed, and afterwards whenever neither a
    /// webhook nor a completed pass has been seen within the drift threshold.
    pub async fn needs_run(&self, entity_type: &EntityType) -> SyncResult<bool> {
        let checkpoint = self.checkpoints.load(entity_type).await?;
        let Some(completed_at) = checkpoint
            .filter(|c| c.status == CheckpointStatus::Completed)
            .and_then(|c| c.completed_at)
        else {
            return Ok(true);
        };

        let last_signal = match self.ledger.latest_processed_at().await? {
            Some(seen) => seen.max(completed_at),
            None => completed_at,
        };
        let silence = (Utc::now() - last_signal).to_std().unwrap_or_default();
        Ok(silence > self.config.drift_threshold())
    }

    /// Run one pass, resuming an interrupted one unless `restart` is set.
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn run(&self, entity_type: &EntityType, restart: bool) -> SyncResult<SyncCheckpoint> {
        let mut checkpoint = match self.checkpoints.load(entity_type).await? {
            Some(existing) if existing.is_resumable() && !restart => {
                info!(
                    cursor = existing.cursor.as_deref().unwrap_or("<start>"),
                    pages_synced = existing.pages_synced,
                    "resuming reconciliation"
                );
                existing
            }
            _ => {
                info!("starting reconciliation");
                let fresh = SyncCheckpoint::start(entity_type.clone());
                self.checkpoints.save(&fresh).await?;
                fresh
            }
        };

        loop {
            let cursor = checkpoint.cursor.clone();
            let page = fetch_with_retry(&self.governor, &self.retry, Priority::Background, || {
                let upstream = Arc::clone(&self.upstream);
                let (entity_type, cursor) = (entity_type.clone(), cursor.clone());
                let limit = self.config.page_size;
                async move { upstream.list_page(&entity_type, cursor.as_deref(), limit).await }
            })
            .await?;

            let mut confirmed = Vec::new();
            for record in &page.records {
                let outcome = self
                    .replica
                    .upsert(entity_type, &record.external_id, &record.payload, record.version)
                    .await?;
                match outcome {
                    ApplyOutcome::Applied => {
                        checkpoint.records_applied += 1;
                        invalidate_entity(&self.cache, entity_type, &record.external_id);
                    }
                    ApplyOutcome::Stale { .. } | ApplyOutcome::Duplicate => {
                        checkpoint.records_stale += 1;
                        confirmed.push(record.external_id.clone());
                    }
                }
            }
            if !confirmed.is_empty() {
                self.replica.mark_synced(entity_type, &confirmed).await?;
            }
            self.cache.invalidate(&cache::list_tag(entity_type));

            checkpoint.pages_synced += 1;
            checkpoint.updated_at = Utc::now();
            checkpoint.cursor = page.next_cursor.clone();
            let done = page.next_cursor.is_none();
            if done {
                checkpoint.status = CheckpointStatus::Completed;
                checkpoint.completed_at = Some(checkpoint.updated_at);
            }
            self.checkpoints.save(&checkpoint).await?;
            debug!(
                pages_synced = checkpoint.pages_synced,
                records = page.records.len(),
                "reconciliation page applied"
            );
            if let Some(progress) = &self.progress {
                progress(&checkpoint);
            }
            if done {
                break;
            }
        }

        info!(
            pages_synced = checkpoint.pages_synced,
            records_applied = checkpoint.records_applied,
            records_stale = checkpoint.records_stale,
            "reconciliation completed"
        );
        Ok(checkpoint)
    }

    /// Run every configured entity type that [`Self::needs_run`].
    pub async fn run_due(&self) -> SyncResult<Vec<SyncCheckpoint>> {
        let mut finished = Vec::new();
        for entity_type in self.entity_types() {
            if self.needs_run(&entity_type).await? {
                finished.push(self.run(&entity_type, false).await?);
            } else {
                debug!(%entity_type, "replica within drift threshold");
            }
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteCheckpointRepository, SqliteLedgerRepository, SqliteReplicaRepository,
    };
    use crate::domain::models::{ApiSurface, CacheConfig, GovernorSettings, UpstreamPage, UpstreamRecord};
    use crate::domain::ports::UpstreamError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Three pages of two records; optionally refuses one cursor once.
    struct PagedUpstream {
        fail_cursor: Mutex<Option<String>>,
        cursors_seen: Mutex<Vec<Option<String>>>,
    }

    fn record(id: u32, version: u64) -> UpstreamRecord {
        UpstreamRecord {
            external_id: id.to_string(),
            version,
            payload: json!({"id": id, "version": version}),
        }
    }

    #[async_trait]
    impl UpstreamClient for PagedUpstream {
        fn surface(&self) -> ApiSurface {
            ApiSurface::Rest
        }

        async fn fetch_entity(&self, _: &EntityType, _: &str) -> Result<Option<UpstreamRecord>, UpstreamError> {
            Ok(None)
        }

        async fn list_page(&self, _: &EntityType, cursor: Option<&str>, _: u32) -> Result<UpstreamPage, UpstreamError> {
            self.cursors_seen.lock().unwrap().push(cursor.map(str::to_string));
            let mut fail = self.fail_cursor.lock().unwrap();
            if fail.as_deref().is_some() && fail.as_deref() == cursor {
                *fail = None;
                return Err(UpstreamError::Rejected {
                    status: 400,
                    message: "bad cursor".into(),
                });
            }
            let (records, next) = match cursor {
                None => (vec![record(1, 1), record(2, 1)], Some("p2")),
                Some("p2") => (vec![record(3, 1), record(4, 1)], Some("p3")),
                _ => (vec![record(5, 1), record(6, 1)], None),
            };
            Ok(UpstreamPage {
                records,
                next_cursor: next.map(str::to_string),
            })
        }
    }

    async fn job(upstream: Arc<PagedUpstream>) -> (ReconciliationJob, Arc<SqliteReplicaRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let replica = Arc::new(SqliteReplicaRepository::new(pool.clone()));
        let job = ReconciliationJob::new(
            upstream,
            Arc::new(UpstreamGovernor::new(ApiSurface::Rest, GovernorSettings::new(100, 100.0))),
            replica.clone(),
            Arc::new(SqliteCheckpointRepository::new(pool.clone())),
            Arc::new(SqliteLedgerRepository::new(pool)),
            Arc::new(ReadCache::new(&CacheConfig::default())),
            RetryPolicy::none(),
            ReconciliationConfig {
                drift_threshold_secs: 60,
                ..ReconciliationConfig::default()
            },
        );
        (job, replica)
    }

    fn products() -> EntityType {
        EntityType::new("products").unwrap()
    }

    fn upstream(fail_cursor: Option<&str>) -> Arc<PagedUpstream> {
        Arc::new(PagedUpstream {
            fail_cursor: Mutex::new(fail_cursor.map(str::to_string)),
            cursors_seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_full_pass_completes() {
        let (job, replica) = job(upstream(None)).await;
        assert!(job.needs_run(&products()).await.unwrap());

        let checkpoint = job.run(&products(), false).await.unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Completed);
        assert_eq!(checkpoint.pages_synced, 3);
        assert_eq!(checkpoint.records_applied, 6);
        assert!(checkpoint.cursor.is_none());
        assert!(replica.get(&products(), "6").await.unwrap().is_some());
        assert!(!job.needs_run(&products()).await.unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_pass_resumes_from_checkpoint() {
        let source = upstream(Some("p3"));
        let (job, _) = job(source.clone()).await;

        assert!(job.run(&products(), false).await.is_err());
        let saved = job.checkpoints.load(&products()).await.unwrap().unwrap();
        assert_eq!(saved.cursor.as_deref(), Some("p3"));
        assert_eq!(saved.pages_synced, 2);

        let finished = job.run(&products(), false).await.unwrap();
        assert_eq!(finished.pages_synced, 3);
        assert_eq!(finished.records_applied, 6);

        let seen = source.cursors_seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![None, Some("p2".to_string()), Some("p3".to_string()), Some("p3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_second_pass_counts_stale_and_refreshes_synced_at() {
        let (job, replica) = job(upstream(None)).await;
        job.run(&products(), false).await.unwrap();
        let before = replica.get(&products(), "1").await.unwrap().unwrap().synced_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = job.run(&products(), false).await.unwrap();
        assert_eq!(second.records_applied, 0);
        assert_eq!(second.records_stale, 6);
        let after = replica.get(&products(), "1").await.unwrap().unwrap().synced_at;
        assert!(after > before);
    }
}
