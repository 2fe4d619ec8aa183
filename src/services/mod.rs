pub mod catalog;
pub mod coalescer;
pub mod deferred_jobs;
pub mod governor;
pub mod keyed_locks;
pub mod maintenance;
pub mod reconciliation;
pub mod retry;
pub mod webhook_pipeline;

pub use catalog::{invalidate_entity, CachedRead, ReadCache, SyncedCatalog};
pub use coalescer::{CoalescerStats, RequestCoalescer};
pub use deferred_jobs::{ChangeHandler, DeferredJobWorker, DrainReport, WorkerHandle};
pub use governor::{GovernorSet, GovernorStats, Priority, UpstreamGovernor};
pub use keyed_locks::KeyedLocks;
pub use maintenance::{DaemonHandle, MaintenanceDaemon, MaintenanceDaemonConfig, MaintenanceEvent, SweepReport};
pub use reconciliation::{ProgressFn, ReconciliationJob};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use webhook_pipeline::{
    sign, verify_signature, WebhookMetrics, WebhookMetricsSnapshot, WebhookPipeline, WebhookRequest,
    WebhookResponse,
};
