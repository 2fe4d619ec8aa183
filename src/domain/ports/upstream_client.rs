use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::errors::SyncError;
use crate::domain::models::{ApiSurface, EntityType, UpstreamPage, UpstreamRecord};

/// Failures talking to the upstream system of record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream signalled overload (HTTP 429 or equivalent).
    #[error("Rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout or 5xx.
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// Permanent refusal; retrying will not help.
    #[error("Upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

impl From<UpstreamError> for SyncError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited { .. } | UpstreamError::Unavailable(_) => {
                Self::UpstreamUnavailable(err.to_string())
            }
            UpstreamError::Rejected { status, message } => Self::UpstreamRejected { status, message },
            UpstreamError::Decode(msg) => Self::Serialization(msg),
        }
    }
}

/// The rate-limited upstream API.
///
/// Implementations perform exactly one request per call; admission control
/// and retries are the caller's job.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Which rate budget calls through this client are charged against.
    fn surface(&self) -> ApiSurface;

    /// Fetch one entity; `Ok(None)` when upstream reports it does not exist.
    async fn fetch_entity(
        &self,
        entity_type: &EntityType,
        external_id: &str,
    ) -> Result<Option<UpstreamRecord>, UpstreamError>;

    /// Fetch one page of the full collection.
    async fn list_page(
        &self,
        entity_type: &EntityType,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<UpstreamPage, UpstreamError>;
}
