//! Maintenance daemon
//!
//! Periodically hard-deletes old tombstones, prunes the idempotency ledger
//! and drops dead keys from the cache tag index.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::domain::errors::SyncResult;
use crate::domain::models::{MaintenanceConfig, WebhookConfig};
use crate::domain::ports::{IdempotencyLedger, ReplicaStore};
use crate::services::catalog::ReadCache;

/// Configuration for the maintenance daemon.
#[derive(Debug, Clone)]
pub struct MaintenanceDaemonConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    pub tombstone_retention: Duration,
    /// Must cover upstream's longest redelivery window.
    pub ledger_retention: Duration,
    /// Stop after this many failed sweeps in a row.
    pub max_consecutive_failures: u32,
    pub run_on_startup: bool,
}

impl Default for MaintenanceDaemonConfig {
    fn default() -> Self {
        Self::from_config(&MaintenanceConfig::default(), &WebhookConfig::default())
    }
}

impl MaintenanceDaemonConfig {
    pub fn from_config(maintenance: &MaintenanceConfig, webhook: &WebhookConfig) -> Self {
        Self {
            interval: Duration::from_secs(maintenance.interval_secs.max(1)),
            tombstone_retention: maintenance.tombstone_retention(),
            ledger_retention: webhook.ledger_retention(),
            max_consecutive_failures: maintenance.max_consecutive_failures.max(1),
            run_on_startup: false,
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub tombstones_removed: u64,
    pub ledger_pruned: u64,
    pub index_keys_pruned: u64,
}

#[derive(Debug, Clone)]
pub enum MaintenanceEvent {
    Started,
    SweepCompleted { run_number: u64, report: SweepReport, duration_ms: u64 },
    SweepFailed { run_number: u64, error: String },
    Stopped { reason: StopReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    TooManyFailures,
}

#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    pub running: bool,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_run: Option<Instant>,
    pub total_tombstones_removed: u64,
    pub total_ledger_pruned: u64,
}

/// Handle to control the daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<DaemonStatus>>,
}

impl DaemonHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> DaemonStatus {
        self.status.read().await.clone()
    }
}

pub struct MaintenanceDaemon {
    replica: Arc<dyn ReplicaStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    cache: Arc<ReadCache>,
    config: MaintenanceDaemonConfig,
    status: Arc<RwLock<DaemonStatus>>,
    stop_flag: Arc<AtomicBool>,
}

impl MaintenanceDaemon {
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        cache: Arc<ReadCache>,
        config: MaintenanceDaemonConfig,
    ) -> Self {
        Self {
            replica,
            ledger,
            cache,
            config,
            status: Arc::new(RwLock::new(DaemonStatus::default())),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            stop_flag: Arc::clone(&self.stop_flag),
            status: Arc::clone(&self.status),
        }
    }

    /// One sweep, outside the loop. Used by the `sweep` command.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let now = Utc::now();
        let tombstone_cutoff = now - chrono::Duration::from_std(self.config.tombstone_retention).unwrap_or_default();
        let ledger_cutoff = now - chrono::Duration::from_std(self.config.ledger_retention).unwrap_or_default();

        let tombstones_removed = self.replica.sweep_tombstones(tombstone_cutoff).await?;
        let ledger_pruned = self.ledger.prune(ledger_cutoff).await?;
        let index_keys_pruned = self.cache.sweep_index() as u64;

        Ok(SweepReport {
            tombstones_removed,
            ledger_pruned,
            index_keys_pruned,
        })
    }

    /// Spawn the loop, returning a channel of daemon events.
    pub fn run(self) -> mpsc::Receiver<MaintenanceEvent> {
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            self.run_loop(tx).await;
        });
        rx
    }

    async fn run_loop(self, tx: mpsc::Sender<MaintenanceEvent>) {
        self.status.write().await.running = true;
        let _ = tx.send(MaintenanceEvent::Started).await;
        info!(interval_secs = self.config.interval.as_secs(), "maintenance daemon started");

        let mut consecutive_failures = 0u32;
        let mut timer = interval(self.config.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.run_on_startup {
            // First tick completes immediately.
            timer.tick().await;
        }

        let reason = loop {
            timer.tick().await;
            if self.stop_flag.load(Ordering::Acquire) {
                break StopReason::Requested;
            }
            self.run_cycle(&tx, &mut consecutive_failures).await;
            if consecutive_failures >= self.config.max_consecutive_failures {
                warn!(consecutive_failures, "maintenance daemon giving up");
                break StopReason::TooManyFailures;
            }
            if self.stop_flag.load(Ordering::Acquire) {
                break StopReason::Requested;
            }
        };

        self.status.write().await.running = false;
        info!(?reason, "maintenance daemon stopped");
        let _ = tx.send(MaintenanceEvent::Stopped { reason }).await;
    }

    async fn run_cycle(&self, tx: &mpsc::Sender<MaintenanceEvent>, consecutive_failures: &mut u32) {
        let run_number = {
            let mut status = self.status.write().await;
            status.total_runs += 1;
            status.total_runs
        };

        let start = Instant::now();
        match self.sweep().await {
            Ok(report) => {
                *consecutive_failures = 0;
                {
                    let mut status = self.status.write().await;
                    status.successful_runs += 1;
                    status.last_run = Some(Instant::now());
                    status.total_tombstones_removed += report.tombstones_removed;
                    status.total_ledger_pruned += report.ledger_pruned;
                }
                let duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    run_number,
                    tombstones_removed = report.tombstones_removed,
                    ledger_pruned = report.ledger_pruned,
                    index_keys_pruned = report.index_keys_pruned,
                    duration_ms,
                    "maintenance sweep completed"
                );
                let _ = tx
                    .send(MaintenanceEvent::SweepCompleted {
                        run_number,
                        report,
                        duration_ms,
                    })
                    .await;
            }
            Err(e) => {
                *consecutive_failures += 1;
                self.status.write().await.failed_runs += 1;
                warn!(run_number, error = %e, "maintenance sweep failed");
                let _ = tx
                    .send(MaintenanceEvent::SweepFailed {
                        run_number,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteLedgerRepository, SqliteReplicaRepository};
    use crate::domain::errors::SyncError;
    use crate::domain::models::{CacheConfig, EntityType};
    use async_trait::async_trait;
    use chrono::DateTime;

    async fn daemon(config: MaintenanceDaemonConfig) -> (MaintenanceDaemon, Arc<SqliteReplicaRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let replica = Arc::new(SqliteReplicaRepository::new(pool.clone()));
        let daemon = MaintenanceDaemon::new(
            replica.clone(),
            Arc::new(SqliteLedgerRepository::new(pool)),
            Arc::new(ReadCache::new(&CacheConfig::default())),
            config,
        );
        (daemon, replica)
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_tombstones() {
        let config = MaintenanceDaemonConfig {
            tombstone_retention: Duration::ZERO,
            ..MaintenanceDaemonConfig::default()
        };
        let (daemon, replica) = daemon(config).await;
        let products = EntityType::new("products").unwrap();
        replica.delete(&products, "gone", 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        let report = daemon.sweep().await.unwrap();
        assert_eq!(report.tombstones_removed, 1);
        assert!(replica.get(&products, "gone").await.unwrap().is_none());
    }

    struct BrokenLedger;

    #[async_trait]
    impl IdempotencyLedger for BrokenLedger {
        async fn get(&self, _: &str) -> SyncResult<Option<crate::domain::models::ProcessedWebhookRecord>> {
            Ok(None)
        }

        async fn latest_processed_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
            Ok(None)
        }

        async fn prune(&self, _: DateTime<Utc>) -> SyncResult<u64> {
            Err(SyncError::ReplicaWriteFailure("disk I/O error".into()))
        }
    }

    #[tokio::test]
    async fn test_stops_after_consecutive_failures() {
        let pool = create_migrated_test_pool().await.unwrap();
        let daemon = MaintenanceDaemon::new(
            Arc::new(SqliteReplicaRepository::new(pool)),
            Arc::new(BrokenLedger),
            Arc::new(ReadCache::new(&CacheConfig::default())),
            MaintenanceDaemonConfig {
                interval: Duration::from_millis(10),
                max_consecutive_failures: 2,
                run_on_startup: true,
                ..MaintenanceDaemonConfig::default()
            },
        );
        let handle = daemon.handle();
        let mut events = daemon.run();

        let mut failures = 0;
        while let Some(event) = events.recv().await {
            match event {
                MaintenanceEvent::SweepFailed { .. } => failures += 1,
                MaintenanceEvent::Stopped { reason } => {
                    assert_eq!(reason, StopReason::TooManyFailures);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(failures, 2);
        let status = handle.status().await;
        assert!(!status.running);
        assert_eq!(status.failed_runs, 2);
    }

    #[tokio::test]
    async fn test_stop_requested() {
        let (daemon, _) = daemon(MaintenanceDaemonConfig {
            interval: Duration::from_millis(10),
            ..MaintenanceDaemonConfig::default()
        })
        .await;
        let handle = daemon.handle();
        let mut events = daemon.run();
        assert!(matches!(events.recv().await, Some(MaintenanceEvent::Started)));

        handle.stop();
        loop {
            match events.recv().await {
                Some(MaintenanceEvent::Stopped { reason }) => {
                    assert_eq!(reason, StopReason::Requested);
                    break;
                }
                Some(_) => {}
                None => panic!("daemon exited without a stop event"),
            }
        }
    }
}
