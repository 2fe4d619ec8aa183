//! Webhook ingestion: verify, decode, apply under a per-entity lock, ack.
//!
//! A delivery moves through `received → verified → applied | duplicate →
//! acknowledged → cache_invalidated`. Any failure before acknowledgement
//! yields a non-2xx status so upstream redelivers; duplicates and stale
//! versions are acknowledged because redelivering them changes nothing.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::models::{ApplyOutcome, VersionSource, WebhookConfig, WebhookEvent, WebhookState};
use crate::domain::ports::ReplicaStore;
use crate::services::catalog::{invalidate_entity, ReadCache};
use crate::services::keyed_locks::KeyedLocks;

type HmacSha256 = Hmac<Sha256>;

/// Compute the base64 HMAC-SHA256 signature of `body`.
pub fn sign(secret: &str, body: &[u8]) -> SyncResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::SignatureInvalid(format!("invalid secret: {e}")))?;
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Check `signature` against the HMAC-SHA256 of `body`.
///
/// Accepts a base64 digest or `sha256=<hex>`. The comparison is constant time.
pub fn verify_signature(secret: Option<&str>, body: &[u8], signature: Option<&str>) -> SyncResult<()> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::SignatureInvalid("no webhook secret configured".to_string()))?;
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::SignatureInvalid("missing signature".to_string()))?;

    let expected = match signature.strip_prefix("sha256=") {
        Some(hex_sig) => hex::decode(hex_sig).map_err(|e| SyncError::SignatureInvalid(format!("invalid hex: {e}")))?,
        None => BASE64
            .decode(signature)
            .map_err(|e| SyncError::SignatureInvalid(format!("invalid base64: {e}")))?,
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::SignatureInvalid(format!("invalid secret: {e}")))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SyncError::SignatureInvalid("signature mismatch".to_string()))
}

/// One raw delivery as received over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Delivery id header, if upstream sent one.
    pub event_id: Option<String>,
    pub topic: String,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

/// What to answer upstream with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    pub state: WebhookState,
    pub outcome: Option<ApplyOutcome>,
    pub correlation_id: Uuid,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookMetricsSnapshot {
    pub received: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub applied: u64,
    pub failed: u64,
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct WebhookMetrics {
    received: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl WebhookMetrics {
    fn record_outcome(&self, outcome: ApplyOutcome) {
        let counter = match outcome {
            ApplyOutcome::Applied => &self.applied,
            ApplyOutcome::Stale { .. } => &self.stale,
            ApplyOutcome::Duplicate => &self.duplicates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WebhookMetricsSnapshot {
        WebhookMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Verifies and applies change notifications.
#[derive(Clone)]
pub struct WebhookPipeline {
    secret: Option<String>,
    id_field: String,
    version_source: VersionSource,
    ack_budget: Duration,
    replica: Arc<dyn ReplicaStore>,
    cache: Arc<ReadCache>,
    locks: Arc<KeyedLocks>,
    metrics: Arc<WebhookMetrics>,
    job_signal: Option<Arc<Notify>>,
}

impl WebhookPipeline {
    pub fn new(
        config: &WebhookConfig,
        version_source: VersionSource,
        replica: Arc<dyn ReplicaStore>,
        cache: Arc<ReadCache>,
    ) -> Self {
        Self {
            secret: config.secret.clone(),
            id_field: config.id_field.clone(),
            version_source,
            ack_budget: config.ack_budget(),
            replica,
            cache,
            locks: Arc::new(KeyedLocks::new()),
            metrics: Arc::new(WebhookMetrics::default()),
            job_signal: None,
        }
    }

    /// Wake the deferred-job worker after each applied event.
    #[must_use]
    pub fn with_job_signal(mut self, signal: Arc<Notify>) -> Self {
        self.job_signal = Some(signal);
        self
    }

    pub fn metrics(&self) -> WebhookMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Process one delivery end to end.
    pub async fn handle(&self, request: WebhookRequest) -> WebhookResponse {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("webhook", %correlation_id, topic = %request.topic);
        self.process(request, correlation_id).instrument(span).await
    }

    async fn process(&self, request: WebhookRequest, correlation_id: Uuid) -> WebhookResponse {
        let respond = |status, state, outcome| WebhookResponse {
            status,
            state,
            outcome,
            correlation_id,
        };
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        debug!(state = %WebhookState::Received, bytes = request.body.len());

        if let Err(e) = verify_signature(self.secret.as_deref(), &request.body, request.signature.as_deref()) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(target: "security", error = %e, "webhook signature verification failed");
            return respond(401, WebhookState::Rejected, None);
        }
        debug!(state = %WebhookState::Verified);

        let event = match WebhookEvent::parse(
            request.event_id.as_deref(),
            &request.topic,
            &request.body,
            &self.id_field,
            self.version_source,
        ) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "malformed webhook");
                return respond(400, WebhookState::Failed, None);
            }
        };

        // Detached from the caller: a missed ack budget must not cancel the apply.
        let task = tokio::spawn(
            Self::apply(
                Arc::clone(&self.replica),
                Arc::clone(&self.cache),
                Arc::clone(&self.locks),
                Arc::clone(&self.metrics),
                self.job_signal.clone(),
                event,
            )
            .in_current_span(),
        );

        match tokio::time::timeout(self.ack_budget, task).await {
            Ok(Ok(Ok(outcome))) => {
                let state = match outcome {
                    ApplyOutcome::Applied => WebhookState::CacheInvalidated,
                    ApplyOutcome::Duplicate => WebhookState::Duplicate,
                    ApplyOutcome::Stale { .. } => WebhookState::Acknowledged,
                };
                respond(200, state, Some(outcome))
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "webhook apply failed");
                respond(503, WebhookState::Failed, None)
            }
            Ok(Err(join_err)) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %join_err, "webhook apply task aborted");
                respond(503, WebhookState::Failed, None)
            }
            Err(_) => {
                warn!(
                    budget_ms = self.ack_budget.as_millis() as u64,
                    "webhook apply exceeded ack budget, continuing in background"
                );
                respond(503, WebhookState::Failed, None)
            }
        }
    }

    async fn apply(
        replica: Arc<dyn ReplicaStore>,
        cache: Arc<ReadCache>,
        locks: Arc<KeyedLocks>,
        metrics: Arc<WebhookMetrics>,
        job_signal: Option<Arc<Notify>>,
        event: WebhookEvent,
    ) -> SyncResult<ApplyOutcome> {
        let _entity = locks.lock(&event.entity_key()).await;
        let outcome = match replica.apply_event(&event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        metrics.record_outcome(outcome);

        match outcome {
            ApplyOutcome::Applied => {
                debug!(state = %WebhookState::Applied, version = event.version);
                debug!(state = %WebhookState::Acknowledged);
                invalidate_entity(&cache, &event.entity_type, &event.external_id);
                if let Some(signal) = job_signal {
                    signal.notify_one();
                }
                info!(
                    event_id = %event.event_id,
                    entity = %event.entity_key(),
                    version = event.version,
                    state = %WebhookState::CacheInvalidated,
                    "webhook applied"
                );
            }
            ApplyOutcome::Duplicate => {
                debug!(event_id = %event.event_id, state = %WebhookState::Duplicate, "duplicate delivery");
            }
            ApplyOutcome::Stale { stored_version } => {
                info!(
                    event_id = %event.event_id,
                    entity = %event.entity_key(),
                    version = event.version,
                    stored_version,
                    "stale webhook discarded"
                );
            }
        }
        Ok(outcome)
    }
}
