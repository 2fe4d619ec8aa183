//! Drains the deferred-job outbox written by webhook applies.
//!
//! Each job turns into a [`ChangeNotice`]. Registered handlers run first; a
//! handler failure reschedules the job with exponential backoff until the
//! retry policy gives up. Once every handler succeeds the notice is published
//! on a broadcast feed and the job is marked done.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::errors::SyncResult;
use crate::domain::models::{ChangeNotice, DeferredJob, MaintenanceConfig};
use crate::domain::ports::JobQueue;
use crate::services::retry::RetryPolicy;

const FEED_CAPACITY: usize = 1_024;

/// Downstream effect of a committed change.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, notice: &ChangeNotice) -> Result<(), String>;
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: u64,
    pub rescheduled: u64,
    pub abandoned: u64,
}

/// Handle to stop a running worker.
pub struct WorkerHandle {
    stop_flag: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    /// Stop and wait for the current pass to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            error!(error = %e, "deferred job worker panicked");
        }
    }
}

pub struct DeferredJobWorker {
    jobs: Arc<dyn JobQueue>,
    handlers: Vec<Arc<dyn ChangeHandler>>,
    feed: broadcast::Sender<ChangeNotice>,
    retry: RetryPolicy,
    poll_interval: Duration,
    batch_size: u32,
    wakeup: Arc<Notify>,
}

impl DeferredJobWorker {
    pub fn new(jobs: Arc<dyn JobQueue>, retry: RetryPolicy, config: &MaintenanceConfig) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            jobs,
            handlers: Vec::new(),
            feed,
            retry,
            poll_interval: Duration::from_millis(config.job_poll_interval_ms),
            batch_size: config.job_batch_size.max(1),
            wakeup: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ChangeHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Share a wakeup signal with the producer of jobs.
    #[must_use]
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = wakeup;
        self
    }

    /// Subscribe to published change notices.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.feed.subscribe()
    }

    /// Notified to run a pass before the poll interval elapses.
    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Process every job due now, in batches.
    pub async fn run_once(&self) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let batch = self.jobs.due(Utc::now(), self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() >= self.batch_size as usize;
            for job in &batch {
                self.process(job, &mut report).await?;
            }
            if !full {
                break;
            }
        }
        if report != DrainReport::default() {
            debug!(?report, "deferred jobs drained");
        }
        Ok(report)
    }

    async fn process(&self, job: &DeferredJob, report: &mut DrainReport) -> SyncResult<()> {
        let notice = ChangeNotice::from(job);
        for handler in &self.handlers {
            if let Err(reason) = handler.handle(&notice).await {
                let message = format!("{}: {reason}", handler.name());
                let attempt = job.attempts + 1;
                if attempt > self.retry.max_retries {
                    error!(job_id = job.id, event_id = %job.event_id, error = %message, "deferred job abandoned");
                    self.jobs.abandon(job.id, &message).await?;
                    report.abandoned += 1;
                } else {
                    let delay = self.retry.backoff_for(attempt);
                    let run_after = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    warn!(job_id = job.id, attempt, delay_ms = delay.as_millis() as u64, error = %message, "deferred job failed, rescheduled");
                    self.jobs.reschedule(job.id, &message, run_after).await?;
                    report.rescheduled += 1;
                }
                return Ok(());
            }
        }

        // No subscribers is not a failure.
        let _ = self.feed.send(notice);
        self.jobs.complete(job.id).await?;
        report.completed += 1;
        Ok(())
    }

    /// Run passes until stopped, on each wakeup or poll tick.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let wakeup = Arc::clone(&self.wakeup);
        let flag = Arc::clone(&stop_flag);
        let join = tokio::spawn(async move {
            info!("deferred job worker started");
            while !flag.load(Ordering::Acquire) {
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "deferred job pass failed");
                }
                tokio::select! {
                    () = self.wakeup.notified() => {}
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            info!("deferred job worker stopped");
        });
        WorkerHandle { stop_flag, wakeup, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteJobRepository, SqliteReplicaRepository};
    use crate::domain::models::{EntityType, VersionSource, WebhookEvent};
    use crate::domain::ports::ReplicaStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct FlakyHandler {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ChangeHandler for FlakyHandler {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _: &ChangeNotice) -> Result<(), String> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err("search index offline".to_string());
            }
            Ok(())
        }
    }

    async fn setup() -> (Arc<SqliteReplicaRepository>, Arc<SqliteJobRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        (
            Arc::new(SqliteReplicaRepository::new(pool.clone())),
            Arc::new(SqliteJobRepository::new(pool)),
        )
    }

    async fn apply(replica: &SqliteReplicaRepository, event_id: &str, version: u64) {
        let body = serde_json::to_vec(&json!({"id": "P1", "version": version})).unwrap();
        let event = WebhookEvent::parse(Some(event_id), "products/update", &body, "id", VersionSource::Sequence).unwrap();
        replica.apply_event(&event).await.unwrap();
    }

    fn config() -> MaintenanceConfig {
        MaintenanceConfig::default()
    }

    #[tokio::test]
    async fn test_publishes_notice_and_completes() {
        let (replica, jobs) = setup().await;
        apply(&replica, "e1", 1).await;

        let worker = DeferredJobWorker::new(jobs.clone(), RetryPolicy::default(), &config());
        let mut feed = worker.subscribe();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.completed, 1);
        let notice = feed.try_recv().unwrap();
        assert_eq!(notice.entity_type, EntityType::new("products").unwrap());
        assert_eq!(notice.event_id, "e1");
        assert_eq!(jobs.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_reschedules_then_abandons() {
        let (replica, jobs) = setup().await;
        apply(&replica, "e1", 1).await;

        let handler = Arc::new(FlakyHandler {
            failures_left: AtomicU32::new(10),
        });
        let retry = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
        let worker = DeferredJobWorker::new(jobs.clone(), retry, &config()).with_handler(handler);

        let first = worker.run_once().await.unwrap();
        assert_eq!(first.rescheduled, 1);
        assert_eq!(jobs.pending_count().await.unwrap(), 1);

        let second = worker.run_once().await.unwrap();
        assert_eq!(second.abandoned, 1);
        assert_eq!(jobs.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_started_worker_drains_on_wakeup() {
        let (replica, jobs) = setup().await;
        let worker = Arc::new(DeferredJobWorker::new(jobs.clone(), RetryPolicy::default(), &config()));
        let mut feed = worker.subscribe();
        let wakeup = worker.wakeup();
        let handle = Arc::clone(&worker).start();

        apply(&replica, "e1", 1).await;
        wakeup.notify_one();
        let notice = tokio::time::timeout(Duration::from_secs(5), feed.recv()).await.unwrap().unwrap();
        assert_eq!(notice.version, 1);

        handle.shutdown().await;
    }
}
