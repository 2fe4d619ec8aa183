//! Explicit retry state for upstream calls.
//!
//! Instead of a retry-with-sleep loop, the caller keeps a [`RetryState`] and
//! asks it what to do after each failure. The decision says whether to retry
//! and when, so attempt counts and delays can be inspected and tested
//! without running the loop.

use std::time::Duration;

use crate::domain::models::RetryConfig;
use crate::domain::ports::UpstreamError;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based): initial * 2^(retry-1), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: self.clone(),
            attempts: 0,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Progress of one retried operation.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and decide on the next step.
    ///
    /// Permanent errors are never retried. An upstream `Retry-After` hint
    /// replaces the computed backoff, capped at `max_backoff`.
    pub fn next_delay(&mut self, error: &UpstreamError) -> RetryDecision {
        self.attempts += 1;
        if !error.is_transient() || self.attempts > self.policy.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = match error {
            UpstreamError::RateLimited {
                retry_after: Some(hint),
            } => (*hint).min(self.policy.max_backoff),
            _ => self.policy.backoff_for(self.attempts),
        };
        RetryDecision::RetryAfter(delay)
    }

    /// Decision for a failure that carries no upstream classification.
    pub fn next_delay_generic(&mut self) -> RetryDecision {
        self.next_delay(&UpstreamError::Unavailable(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(2))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_for(1), Duration::from_millis(500));
        assert_eq!(p.backoff_for(2), Duration::from_millis(1_000));
        assert_eq!(p.backoff_for(3), Duration::from_secs(2));
        assert_eq!(p.backoff_for(10), Duration::from_secs(2));
    }

    #[test]
    fn test_transient_errors_retry_until_exhausted() {
        let mut state = policy().start();
        let err = UpstreamError::Unavailable("connection reset".into());
        assert_eq!(state.next_delay(&err), RetryDecision::RetryAfter(Duration::from_millis(500)));
        assert_eq!(state.next_delay(&err), RetryDecision::RetryAfter(Duration::from_millis(1_000)));
        assert_eq!(state.next_delay(&err), RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert_eq!(state.next_delay(&err), RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 4);
    }

    #[test]
    fn test_permanent_error_gives_up_immediately() {
        let mut state = policy().start();
        let err = UpstreamError::Rejected {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(state.next_delay(&err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_after_hint_overrides_backoff() {
        let mut state = policy().start();
        let hinted = UpstreamError::RateLimited {
            retry_after: Some(Duration::from_millis(1_500)),
        };
        assert_eq!(state.next_delay(&hinted), RetryDecision::RetryAfter(Duration::from_millis(1_500)));

        let huge = UpstreamError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(state.next_delay(&huge), RetryDecision::RetryAfter(Duration::from_secs(2)));
    }
}
