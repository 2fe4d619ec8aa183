//! Port traits implemented by the adapters layer.

pub mod checkpoint_repository;
pub mod idempotency_ledger;
pub mod job_queue;
pub mod replica_store;
pub mod upstream_client;

pub use checkpoint_repository::CheckpointRepository;
pub use idempotency_ledger::IdempotencyLedger;
pub use job_queue::JobQueue;
pub use replica_store::ReplicaStore;
pub use upstream_client::{UpstreamClient, UpstreamError};
