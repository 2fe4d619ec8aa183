use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::SyncResult;
use crate::domain::models::DeferredJob;

/// Outbox of post-commit work written by the webhook apply transaction.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Pending jobs whose `run_after` is at or before `now`, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> SyncResult<Vec<DeferredJob>>;

    async fn complete(&self, id: i64) -> SyncResult<()>;

    /// Record a failed attempt and reschedule.
    async fn reschedule(&self, id: i64, error: &str, run_after: DateTime<Utc>) -> SyncResult<()>;

    /// Give up on a job after its retries are exhausted.
    async fn abandon(&self, id: i64, error: &str) -> SyncResult<()>;

    async fn pending_count(&self) -> SyncResult<u64>;
}
