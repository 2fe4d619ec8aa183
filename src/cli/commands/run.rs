//! `run` command: keep the replica converged until interrupted.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use super::load_config;
use crate::adapters::cache::CacheStats;
use crate::application::SyncRuntime;
use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::ports::JobQueue;
use crate::services::{GovernorStats, MaintenanceEvent, ReconciliationJob, WebhookMetricsSnapshot};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Do not run reconciliation passes, only deferred jobs and maintenance
    #[arg(long)]
    pub skip_reconcile: bool,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub jobs_pending: u64,
    pub webhooks: WebhookMetricsSnapshot,
    pub cache: CacheStats,
    pub governors: Vec<GovernorStats>,
}

impl CommandOutput for RunSummary {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Sweeps: {} completed, {} failed", self.sweeps_completed, self.sweeps_failed),
            format!("Deferred jobs pending: {}", self.jobs_pending),
            format!(
                "Webhooks: {} received, {} applied, {} duplicate, {} stale, {} rejected",
                self.webhooks.received,
                self.webhooks.applied,
                self.webhooks.duplicates,
                self.webhooks.stale,
                self.webhooks.rejected
            ),
            format!(
                "Cache: {} hits, {} stale hits, {} misses, {} entries",
                self.cache.hits, self.cache.stale_hits, self.cache.misses, self.cache.entries
            ),
        ];
        lines.push(TableFormatter::new().format_governors(&self.governors));
        lines.join("\n")
    }
}

pub async fn execute(args: RunArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let runtime = Arc::new(SyncRuntime::build(load_config(config_path)?).await?);

    let worker = Arc::new(runtime.job_worker()).start();
    let daemon = runtime.maintenance();
    let daemon_handle = daemon.handle();
    let mut events = daemon.run();

    let reconciler = if args.skip_reconcile {
        None
    } else {
        let check_every = Duration::from_secs(runtime.config.maintenance.interval_secs.max(1));
        Some(spawn_reconciler(
            runtime.reconciliation(),
            check_every,
            runtime.config.reconciliation.run_on_startup,
        ))
    };

    let mut reloads = reload_signals();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut sweeps_completed = 0u64;
    let mut sweeps_failed = 0u64;
    info!("sync layer running");

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            Some(()) = reloads.recv() => reload(&runtime, config_path.map(Path::to_path_buf)),
            Some(event) = events.recv() => match event {
                MaintenanceEvent::SweepCompleted { .. } => sweeps_completed += 1,
                MaintenanceEvent::SweepFailed { run_number, error } => {
                    sweeps_failed += 1;
                    warn!(run_number, %error, "maintenance sweep failed");
                }
                MaintenanceEvent::Stopped { reason } => {
                    warn!(?reason, "maintenance daemon stopped; continuing without sweeps");
                }
                MaintenanceEvent::Started => {}
            },
        }
    }

    info!("shutting down");
    daemon_handle.stop();
    worker.shutdown().await;
    if let Some(task) = reconciler {
        task.abort();
    }

    let summary = RunSummary {
        sweeps_completed,
        sweeps_failed,
        jobs_pending: runtime.jobs.pending_count().await.unwrap_or_default(),
        webhooks: runtime.webhooks.metrics(),
        cache: runtime.cache.stats(),
        governors: runtime.governors.stats(),
    };
    output(&summary, json);
    Ok(())
}

/// Run due passes on startup (when enabled) and after every `check_every`.
fn spawn_reconciler(job: ReconciliationJob, check_every: Duration, run_on_startup: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(check_every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !run_on_startup {
            timer.tick().await;
        }
        loop {
            timer.tick().await;
            match job.run_due().await {
                Ok(done) if !done.is_empty() => info!(passes = done.len(), "drift check reconciled"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "reconciliation failed; retrying at next check"),
            }
        }
    })
}

fn reload(runtime: &SyncRuntime, config_path: Option<PathBuf>) {
    match load_config(config_path.as_deref()) {
        Ok(config) => runtime.reload_governors(&config.governor),
        Err(e) => warn!(error = %e, "config reload failed; keeping current settings"),
    }
}

/// SIGHUP deliveries, forwarded as unit messages.
#[cfg(unix)]
fn reload_signals() -> mpsc::Receiver<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = mpsc::channel(1);
    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            tokio::spawn(async move {
                while hangup.recv().await.is_some() {
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            });
        }
        Err(e) => warn!(error = %e, "SIGHUP handler unavailable; config reload disabled"),
    }
    rx
}

#[cfg(not(unix))]
fn reload_signals() -> mpsc::Receiver<()> {
    mpsc::channel(1).1
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
