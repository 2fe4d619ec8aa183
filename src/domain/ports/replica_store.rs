use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::errors::SyncResult;
use crate::domain::models::{ApplyOutcome, EntityType, ReplicaEntity, ReplicaPage, ReplicaQuery, WebhookEvent};

/// Durable, queryable copy of upstream entities.
///
/// Every write is version gated: it only takes effect when the incoming
/// upstream version is strictly newer than the stored one. Equal or older
/// versions come back as [`ApplyOutcome::Stale`], never as an error, so
/// out-of-order and duplicate deliveries are harmless.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Insert or replace the payload of an entity if `version` is newer.
    ///
    /// A newer upsert revives a tombstoned row.
    async fn upsert(
        &self,
        entity_type: &EntityType,
        external_id: &str,
        payload: &Value,
        version: u64,
    ) -> SyncResult<ApplyOutcome>;

    /// Tombstone an entity if `version` is newer.
    ///
    /// Unknown ids get a tombstone row so a late, older upsert cannot
    /// resurrect the entity.
    async fn delete(&self, entity_type: &EntityType, external_id: &str, version: u64) -> SyncResult<ApplyOutcome>;

    /// Fetch one row, tombstoned or not.
    async fn get(&self, entity_type: &EntityType, external_id: &str) -> SyncResult<Option<ReplicaEntity>>;

    /// Filtered, keyset-paginated listing of live (non-tombstoned) rows.
    async fn query(&self, query: &ReplicaQuery) -> SyncResult<ReplicaPage>;

    /// Apply a webhook event in one transaction: record the event id in the
    /// idempotency ledger, run the version-gated write and enqueue the
    /// deferred post-commit job.
    ///
    /// Returns [`ApplyOutcome::Duplicate`] without touching anything when the
    /// event id was already recorded.
    async fn apply_event(&self, event: &WebhookEvent) -> SyncResult<ApplyOutcome>;

    /// Mark rows as confirmed against upstream without changing their version.
    async fn mark_synced(&self, entity_type: &EntityType, external_ids: &[String]) -> SyncResult<u64>;

    /// Hard-delete tombstones last changed before `older_than`.
    async fn sweep_tombstones(&self, older_than: DateTime<Utc>) -> SyncResult<u64>;
}
