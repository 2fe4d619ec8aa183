//! Wiring of the synchronization layer from a loaded [`Config`].

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use crate::adapters::sqlite::{
    initialize_database, PoolConfig, SqliteCheckpointRepository, SqliteJobRepository, SqliteLedgerRepository,
    SqliteReplicaRepository,
};
use crate::adapters::upstream::HttpUpstreamClient;
use crate::domain::models::{Config, GovernorConfig};
use crate::domain::ports::UpstreamClient;
use crate::services::{
    DeferredJobWorker, GovernorSet, MaintenanceDaemon, MaintenanceDaemonConfig, ReadCache, ReconciliationJob,
    RetryPolicy, SyncedCatalog, UpstreamGovernor, WebhookPipeline,
};

/// Every long-lived component, sharing one pool, one cache and one set of
/// governors.
pub struct SyncRuntime {
    pub config: Config,
    pub pool: SqlitePool,
    pub replica: Arc<SqliteReplicaRepository>,
    pub ledger: Arc<SqliteLedgerRepository>,
    pub checkpoints: Arc<SqliteCheckpointRepository>,
    pub jobs: Arc<SqliteJobRepository>,
    pub governors: GovernorSet,
    pub cache: Arc<ReadCache>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub catalog: SyncedCatalog,
    pub webhooks: WebhookPipeline,
    job_signal: Arc<Notify>,
}

impl SyncRuntime {
    /// Open the configured database and talk to upstream over HTTP.
    pub async fn build(config: Config) -> Result<Self> {
        let pool = initialize_database(&config.database.url(), Some(PoolConfig::from(&config.database)))
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;
        let upstream = HttpUpstreamClient::new(&config.upstream, config.version_source)
            .context("Failed to build upstream client")?;
        info!(database = %config.database.path, upstream = %config.upstream.base_url, "runtime ready");
        Ok(Self::with_upstream(config, pool, Arc::new(upstream)))
    }

    /// Assemble around an existing pool and upstream client.
    pub fn with_upstream(config: Config, pool: SqlitePool, upstream: Arc<dyn UpstreamClient>) -> Self {
        let replica = Arc::new(SqliteReplicaRepository::new(pool.clone()));
        let ledger = Arc::new(SqliteLedgerRepository::new(pool.clone()));
        let checkpoints = Arc::new(SqliteCheckpointRepository::new(pool.clone()));
        let jobs = Arc::new(SqliteJobRepository::new(pool.clone()));
        let governors = GovernorSet::new(&config.governor);
        let cache = Arc::new(ReadCache::new(&config.cache));
        let job_signal = Arc::new(Notify::new());

        let catalog = SyncedCatalog::new(
            Arc::clone(&upstream),
            governors.get(upstream.surface()),
            replica.clone(),
            Arc::clone(&cache),
            RetryPolicy::from(&config.retry),
            &config.cache,
        );
        let webhooks = WebhookPipeline::new(&config.webhook, config.version_source, replica.clone(), Arc::clone(&cache))
            .with_job_signal(Arc::clone(&job_signal));

        Self {
            config,
            pool,
            replica,
            ledger,
            checkpoints,
            jobs,
            governors,
            cache,
            upstream,
            catalog,
            webhooks,
            job_signal,
        }
    }

    pub fn governor(&self) -> Arc<UpstreamGovernor> {
        self.governors.get(self.upstream.surface())
    }

    pub fn reconciliation(&self) -> ReconciliationJob {
        ReconciliationJob::new(
            Arc::clone(&self.upstream),
            self.governor(),
            self.replica.clone(),
            self.checkpoints.clone(),
            self.ledger.clone(),
            Arc::clone(&self.cache),
            RetryPolicy::from(&self.config.retry),
            self.config.reconciliation.clone(),
        )
    }

    /// Worker woken by every applied webhook.
    pub fn job_worker(&self) -> DeferredJobWorker {
        DeferredJobWorker::new(
            self.jobs.clone(),
            RetryPolicy::from(&self.config.retry),
            &self.config.maintenance,
        )
        .with_wakeup(Arc::clone(&self.job_signal))
    }

    pub fn maintenance(&self) -> MaintenanceDaemon {
        MaintenanceDaemon::new(
            self.replica.clone(),
            self.ledger.clone(),
            Arc::clone(&self.cache),
            MaintenanceDaemonConfig::from_config(&self.config.maintenance, &self.config.webhook),
        )
    }

    /// Apply new rate budgets without dropping queued callers.
    pub fn reload_governors(&self, config: &GovernorConfig) {
        self.governors.reconfigure(config);
        info!(
            rest_capacity = config.rest.capacity,
            rest_rate = config.rest.refill_per_sec,
            graphql_capacity = config.graphql.capacity,
            graphql_rate = config.graphql.refill_per_sec,
            "governor settings reloaded"
        );
    }
}
