//! Read facade over cache, coalescer, governor, upstream and replica.
//!
//! Detail reads go cache → coalesced upstream fetch → replica upsert → cache.
//! When upstream is out of budget or down, reads degrade to the stale cache
//! entry, then to the replica row, and only then fail with
//! `TemporarilyUnavailable`. List queries are answered from the replica and
//! cached with the shorter list TTL.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::adapters::cache::{self, CacheManager, CacheTicket};
use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::models::{
    ApplyOutcome, CacheConfig, DataSource, EntityType, Fresh, ReplicaEntity, ReplicaPage, ReplicaQuery,
    Staleness, UpstreamRecord,
};
use crate::domain::ports::{ReplicaStore, UpstreamClient, UpstreamError};
use crate::services::coalescer::RequestCoalescer;
use crate::services::governor::{Priority, UpstreamGovernor};
use crate::services::retry::{RetryDecision, RetryPolicy};

/// Values held by the read cache.
#[derive(Debug, Clone)]
pub enum CachedRead {
    Entity(Arc<ReplicaEntity>),
    Page(Arc<ReplicaPage>),
}

pub type ReadCache = CacheManager<CachedRead>;

/// Drop every cached read that may include this entity.
pub fn invalidate_entity(cache: &ReadCache, entity_type: &EntityType, external_id: &str) {
    cache.invalidate(&cache::entity_tag(entity_type, external_id));
    cache.invalidate(&cache::list_tag(entity_type));
}

fn since(ts: chrono::DateTime<Utc>) -> Duration {
    (Utc::now() - ts).to_std().unwrap_or_default()
}

/// Call upstream for one entity, retrying transient failures with fresh
/// governor tokens. Only a coalescing owner runs this.
pub(crate) async fn fetch_with_retry<T, F, Fut>(
    governor: &UpstreamGovernor,
    retry: &RetryPolicy,
    priority: Priority,
    mut call: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UpstreamError>>,
{
    let mut state = retry.start();
    loop {
        governor.acquire(1, priority).await?;
        match call().await {
            Ok(value) => {
                governor.note_success();
                return Ok(value);
            }
            Err(err) => {
                if let UpstreamError::RateLimited { retry_after } = &err {
                    governor.note_rate_limited(*retry_after);
                }
                match state.next_delay(&err) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            surface = %governor.surface(),
                            attempt = state.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "upstream call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => return Err(err.into()),
                }
            }
        }
    }
}

/// Cache-fronted, replica-backed catalog reads.
#[derive(Clone)]
pub struct SyncedCatalog {
    upstream: Arc<dyn UpstreamClient>,
    governor: Arc<UpstreamGovernor>,
    replica: Arc<dyn ReplicaStore>,
    cache: Arc<ReadCache>,
    coalescer: Arc<RequestCoalescer<ReplicaEntity>>,
    retry: RetryPolicy,
    detail_ttl: Duration,
    list_ttl: Duration,
}

impl SyncedCatalog {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        governor: Arc<UpstreamGovernor>,
        replica: Arc<dyn ReplicaStore>,
        cache: Arc<ReadCache>,
        retry: RetryPolicy,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            upstream,
            governor,
            replica,
            cache,
            coalescer: Arc::new(RequestCoalescer::new()),
            retry,
            detail_ttl: cache_config.detail_ttl(),
            list_ttl: cache_config.list_ttl(),
        }
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    pub fn coalescer(&self) -> &RequestCoalescer<ReplicaEntity> {
        &self.coalescer
    }

    /// Read one entity with a staleness indicator.
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn get_entity(&self, entity_type: &EntityType, external_id: &str) -> SyncResult<Fresh<ReplicaEntity>> {
        let key = cache::detail_key(entity_type, external_id);
        if let Some((CachedRead::Entity(entity), age)) = self.cache.get_with_age(&key) {
            return Ok(Fresh::new((*entity).clone(), Staleness::fresh(DataSource::Cache, age)));
        }

        let result = self
            .coalescer
            .request(&key, || {
                // Taken when the fetch starts, so invalidations during it win.
                let ticket = self.cache.ticket(&cache::detail_tags(entity_type, external_id));
                let this = self.clone();
                let (entity_type, external_id) = (entity_type.clone(), external_id.to_string());
                async move { this.load_from_upstream(entity_type, external_id, ticket).await }
            })
            .await;

        match result {
            Ok(entity) => Ok(Fresh::new(entity, Staleness::fresh(DataSource::Upstream, Duration::ZERO))),
            Err(err) if err.allows_stale_fallback() => self.fallback(entity_type, external_id, &key, err).await,
            Err(err) => Err(err),
        }
    }

    async fn load_from_upstream(
        &self,
        entity_type: EntityType,
        external_id: String,
        ticket: CacheTicket,
    ) -> SyncResult<ReplicaEntity> {
        let upstream = Arc::clone(&self.upstream);
        let record = fetch_with_retry(&self.governor, &self.retry, Priority::Interactive, || {
            let upstream = Arc::clone(&upstream);
            let (entity_type, external_id) = (entity_type.clone(), external_id.clone());
            async move { upstream.fetch_entity(&entity_type, &external_id).await }
        })
        .await?;

        let not_found = || SyncError::NotFound {
            entity_type: entity_type.to_string(),
            external_id: external_id.clone(),
        };
        let Some(record) = record else {
            return Err(not_found());
        };

        let entity = match self
            .replica
            .upsert(&entity_type, &record.external_id, &record.payload, record.version)
            .await
        {
            Ok(outcome) => {
                match outcome {
                    // The detail entry is refilled below under the ticket.
                    ApplyOutcome::Applied => {
                        self.cache.invalidate(&cache::list_tag(&entity_type));
                    }
                    ApplyOutcome::Stale { stored_version } => debug!(
                        external_id = %record.external_id,
                        fetched_version = record.version,
                        stored_version,
                        "replica already newer than upstream read"
                    ),
                    ApplyOutcome::Duplicate => {}
                }
                // The replica row is the version-gate winner; serve and cache that.
                match self.replica.get(&entity_type, &record.external_id).await? {
                    Some(entity) => entity,
                    None => return Err(not_found()),
                }
            }
            Err(err) => {
                warn!(
                    external_id = %record.external_id,
                    version = record.version,
                    error = %err,
                    "replica write failed, serving upstream record"
                );
                self.newest_of(&entity_type, record).await
            }
        };
        if entity.tombstoned {
            return Err(not_found());
        }

        let key = cache::detail_key(&entity_type, &external_id);
        self.cache
            .set_with_ticket(&key, CachedRead::Entity(Arc::new(entity.clone())), self.detail_ttl, &ticket);
        Ok(entity)
    }

    /// The fetched record, unless the replica already holds a newer version.
    async fn newest_of(&self, entity_type: &EntityType, record: UpstreamRecord) -> ReplicaEntity {
        match self.replica.get(entity_type, &record.external_id).await {
            Ok(Some(stored)) if stored.upstream_version >= record.version => stored,
            _ => {
                let now = Utc::now();
                ReplicaEntity {
                    entity_type: entity_type.clone(),
                    external_id: record.external_id,
                    upstream_version: record.version,
                    payload: record.payload,
                    tombstoned: false,
                    updated_at: now,
                    synced_at: now,
                }
            }
        }
    }

    async fn fallback(
        &self,
        entity_type: &EntityType,
        external_id: &str,
        key: &str,
        cause: SyncError,
    ) -> SyncResult<Fresh<ReplicaEntity>> {
        if let Some((CachedRead::Entity(entity), age)) = self.cache.get_stale(key) {
            info!(external_id, error = %cause, "serving stale cache entry");
            return Ok(Fresh::new((*entity).clone(), Staleness::degraded(DataSource::StaleCache, age)));
        }

        match self.replica.get(entity_type, external_id).await {
            Ok(Some(entity)) if !entity.tombstoned => {
                info!(external_id, error = %cause, "serving replica copy");
                let age = since(entity.synced_at);
                Ok(Fresh::new(entity, Staleness::degraded(DataSource::Replica, age)))
            }
            Ok(Some(_)) => Err(SyncError::NotFound {
                entity_type: entity_type.to_string(),
                external_id: external_id.to_string(),
            }),
            Ok(None) => Err(self.unavailable(entity_type, external_id, cause.to_string())),
            Err(replica_err) => Err(self.unavailable(
                entity_type,
                external_id,
                format!("{cause}; replica read failed: {replica_err}"),
            )),
        }
    }

    fn unavailable(&self, entity_type: &EntityType, external_id: &str, reason: String) -> SyncError {
        warn!(%entity_type, external_id, %reason, "no copy available");
        SyncError::TemporarilyUnavailable {
            entity_type: entity_type.to_string(),
            external_id: external_id.to_string(),
            reason,
        }
    }

    /// Filtered, paginated listing served from the replica.
    #[instrument(skip(self, query), fields(entity_type = %query.entity_type))]
    pub async fn query(&self, query: &ReplicaQuery) -> SyncResult<Fresh<ReplicaPage>> {
        query.validate()?;
        let key = cache::list_key(query);
        if let Some((CachedRead::Page(page), age)) = self.cache.get_with_age(&key) {
            return Ok(Fresh::new((*page).clone(), Staleness::fresh(DataSource::Cache, age)));
        }

        let ticket = self.cache.ticket(&cache::list_tags(&query.entity_type));
        let page = self.replica.query(query).await?;
        let age = page
            .items
            .iter()
            .map(|e| e.synced_at)
            .min()
            .map(since)
            .unwrap_or_default();
        self.cache
            .set_with_ticket(&key, CachedRead::Page(Arc::new(page.clone())), self.list_ttl, &ticket);
        Ok(Fresh::new(page, Staleness::fresh(DataSource::Replica, age)))
    }

    /// Local write path: commit to the replica, then re-issue invalidation so
    /// a fill that started before the commit cannot survive it.
    pub async fn record_local_write(
        &self,
        entity_type: &EntityType,
        external_id: &str,
        payload: &Value,
        version: u64,
    ) -> SyncResult<ApplyOutcome> {
        let outcome = self.replica.upsert(entity_type, external_id, payload, version).await?;
        invalidate_entity(&self.cache, entity_type, external_id);
        Ok(outcome)
    }

    /// Local delete path, same ordering as [`Self::record_local_write`].
    pub async fn record_local_delete(
        &self,
        entity_type: &EntityType,
        external_id: &str,
        version: u64,
    ) -> SyncResult<ApplyOutcome> {
        let outcome = self.replica.delete(entity_type, external_id, version).await?;
        invalidate_entity(&self.cache, entity_type, external_id);
        Ok(outcome)
    }
}
