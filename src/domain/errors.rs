//! Domain errors for the shelfsync synchronization layer.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the read path, the webhook pipeline and the replica.
///
/// The type is `Clone` so that a single upstream failure can be handed to
/// every caller attached to the same coalesced fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The governor could not grant a token within the configured max wait.
    #[error("Rate budget for {surface} not available within {waited:?}")]
    RateLimitTimeout { surface: String, waited: Duration },

    /// The governor wait queue is full; the caller should serve stale data.
    #[error("Rate governor for {surface} saturated ({depth} callers waiting)")]
    GovernorSaturated { surface: String, depth: usize },

    /// Network or server failure from upstream after retries were exhausted.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream refused the request permanently (4xx other than 404/429).
    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("{entity_type} {external_id} not found")]
    NotFound { entity_type: String, external_id: String },

    /// Webhook authenticity check failed.
    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    /// Storage failure while applying a change; acknowledgement is withheld.
    #[error("Replica write failed: {0}")]
    ReplicaWriteFailure(String),

    /// No cache entry, no replica row and upstream unreachable.
    #[error("{entity_type} {external_id} temporarily unavailable: {reason}")]
    TemporarilyUnavailable {
        entity_type: String,
        external_id: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid page cursor: {0}")]
    InvalidCursor(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Errors after which a read may degrade to a stale cached or replicated copy.
    pub fn allows_stale_fallback(&self) -> bool {
        matches!(
            self,
            Self::RateLimitTimeout { .. } | Self::GovernorSaturated { .. } | Self::UpstreamUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::ReplicaWriteFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
