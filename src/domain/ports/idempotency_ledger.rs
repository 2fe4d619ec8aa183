use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::SyncResult;
use crate::domain::models::ProcessedWebhookRecord;

/// Read and retention side of the processed-webhook ledger.
///
/// Inserts happen inside [`super::ReplicaStore::apply_event`] so that the
/// ledger row and the replica mutation commit together.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn get(&self, event_id: &str) -> SyncResult<Option<ProcessedWebhookRecord>>;

    /// Time of the most recently processed event, if any.
    async fn latest_processed_at(&self) -> SyncResult<Option<DateTime<Utc>>>;

    /// Drop records processed before `older_than`. Returns rows removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> SyncResult<u64>;
}
