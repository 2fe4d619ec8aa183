//! Upstream access governor: token-bucket admission control per API surface.
//!
//! Tokens refill continuously from elapsed time. A caller that cannot be
//! served sleeps for exactly the computed shortfall and re-checks, so there
//! is no polling interval. Three further rules shape grants:
//! - no more than `capacity` tokens are granted within any
//!   `capacity / effective_rate` window, even from a full bucket;
//! - background callers yield while any interactive caller is waiting;
//! - once the wait queue reaches `max_queue_depth`, new callers fail fast
//!   with `GovernorSaturated` instead of queuing.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::models::{ApiSurface, GovernorConfig, GovernorSettings};

/// Token shortfalls below this are treated as satisfied.
const TOKEN_EPSILON: f64 = 1e-9;

/// Scheduling class of an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Live reads on behalf of a client.
    Interactive,
    /// Bulk reconciliation; only runs when no interactive caller is waiting.
    Background,
}

/// Point-in-time view of a governor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernorStats {
    pub surface: ApiSurface,
    pub granted: u64,
    pub timed_out: u64,
    pub saturated: u64,
    pub rate_limited: u64,
    pub waiting: usize,
    pub tokens: f64,
    pub effective_rate: f64,
}

struct BucketState {
    settings: GovernorSettings,
    tokens: f64,
    last_refill: Instant,
    /// Multiplier on the configured rate; below 1.0 while backing off.
    rate_factor: f64,
    /// No grants before this instant (upstream `Retry-After`).
    paused_until: Option<Instant>,
    /// Grants inside the current burst window, oldest first.
    recent: VecDeque<(Instant, u32)>,
}

impl BucketState {
    fn new(settings: GovernorSettings, now: Instant) -> Self {
        Self {
            tokens: f64::from(settings.capacity),
            settings,
            last_refill: now,
            rate_factor: 1.0,
            paused_until: None,
            recent: VecDeque::new(),
        }
    }

    fn effective_rate(&self) -> f64 {
        self.settings.refill_per_sec * self.rate_factor
    }

    fn window(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.settings.capacity) / self.effective_rate())
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.effective_rate()).min(f64::from(self.settings.capacity));
        self.last_refill = now;
    }

    /// Take `cost` tokens now, or report how long until that becomes possible.
    fn try_take(&mut self, cost: u32, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        let mut wait = Duration::ZERO;
        match self.paused_until {
            Some(until) if until > now => wait = until - now,
            Some(_) => self.paused_until = None,
            None => {}
        }

        let shortfall = f64::from(cost) - self.tokens;
        if shortfall > TOKEN_EPSILON {
            wait = wait.max(Duration::from_secs_f64(shortfall / self.effective_rate()));
        }

        let window = self.window();
        while self
            .recent
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= window)
        {
            self.recent.pop_front();
        }
        let in_window: u32 = self.recent.iter().map(|(_, c)| *c).sum();
        if in_window + cost > self.settings.capacity {
            // Wait until enough of the oldest grants leave the window.
            let mut freed = 0;
            for (at, c) in &self.recent {
                freed += c;
                if in_window - freed + cost <= self.settings.capacity {
                    wait = wait.max((*at + window).saturating_duration_since(now));
                    break;
                }
            }
        }

        if !wait.is_zero() {
            return Err(wait.max(Duration::from_micros(1)));
        }

        self.tokens = (self.tokens - f64::from(cost)).max(0.0);
        self.recent.push_back((now, cost));
        Ok(())
    }
}

/// Decrements a counter on drop, so cancelled waiters are not leaked.
struct WaitSlot<'a> {
    counter: &'a AtomicUsize,
    notify: Option<&'a Notify>,
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        if let Some(notify) = self.notify {
            notify.notify_waiters();
        }
    }
}

/// Token-bucket governor for one upstream surface.
pub struct UpstreamGovernor {
    surface: ApiSurface,
    state: Mutex<BucketState>,
    waiting: AtomicUsize,
    interactive_waiting: AtomicUsize,
    interactive_left: Notify,
    granted: AtomicU64,
    timed_out: AtomicU64,
    saturated: AtomicU64,
    rate_limited: AtomicU64,
}

impl UpstreamGovernor {
    pub fn new(surface: ApiSurface, settings: GovernorSettings) -> Self {
        Self {
            surface,
            state: Mutex::new(BucketState::new(settings, Instant::now())),
            waiting: AtomicUsize::new(0),
            interactive_waiting: AtomicUsize::new(0),
            interactive_left: Notify::new(),
            granted: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            saturated: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    pub fn surface(&self) -> ApiSurface {
        self.surface
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for `cost` tokens.
    ///
    /// Returns how long the caller waited. Fails with `RateLimitTimeout` when
    /// the tokens cannot be had within `max_wait`, and with
    /// `GovernorSaturated` when too many callers are already queued.
    pub async fn acquire(&self, cost: u32, priority: Priority) -> SyncResult<Duration> {
        let start = Instant::now();
        let (max_wait, max_depth, capacity) = {
            let state = self.state();
            (
                state.settings.max_wait(),
                state.settings.max_queue_depth,
                state.settings.capacity,
            )
        };
        if cost == 0 || cost > capacity {
            return Err(SyncError::Validation(format!(
                "cost {cost} outside 1..={capacity} for {} governor",
                self.surface
            )));
        }
        let deadline = start + max_wait;

        let mut slot: Option<WaitSlot<'_>> = None;
        let mut _interactive_slot: Option<WaitSlot<'_>> = None;

        loop {
            let notified = self.interactive_left.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let yield_to_interactive =
                priority == Priority::Background && self.interactive_waiting.load(Ordering::Acquire) > 0;

            let wait = if yield_to_interactive {
                None
            } else {
                match self.state().try_take(cost, now) {
                    Ok(()) => {
                        self.granted.fetch_add(1, Ordering::Relaxed);
                        let waited = now.saturating_duration_since(start);
                        if !waited.is_zero() {
                            debug!(surface = %self.surface, wait_ms = waited.as_millis() as u64, ?priority, "token granted after wait");
                        }
                        return Ok(waited);
                    }
                    Err(wait) => Some(wait),
                }
            };

            if slot.is_none() {
                let depth = self.waiting.fetch_add(1, Ordering::AcqRel);
                slot = Some(WaitSlot {
                    counter: &self.waiting,
                    notify: None,
                });
                if depth >= max_depth {
                    self.saturated.fetch_add(1, Ordering::Relaxed);
                    warn!(surface = %self.surface, depth, "governor queue saturated");
                    return Err(SyncError::GovernorSaturated {
                        surface: self.surface.to_string(),
                        depth,
                    });
                }
                if priority == Priority::Interactive {
                    self.interactive_waiting.fetch_add(1, Ordering::AcqRel);
                    _interactive_slot = Some(WaitSlot {
                        counter: &self.interactive_waiting,
                        notify: Some(&self.interactive_left),
                    });
                }
            }

            match wait {
                Some(wait) => {
                    if now + wait > deadline {
                        return Err(self.timeout(start));
                    }
                    sleep_until(now + wait).await;
                }
                None => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = sleep_until(deadline) => return Err(self.timeout(start)),
                    }
                }
            }
        }
    }

    fn timeout(&self, start: Instant) -> SyncError {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        let waited = start.elapsed();
        debug!(surface = %self.surface, wait_ms = waited.as_millis() as u64, "token wait exceeded bound");
        SyncError::RateLimitTimeout {
            surface: self.surface.to_string(),
            waited,
        }
    }

    /// Upstream answered with a rate-limit response: drain the bucket, slow
    /// down, and hold all grants until `retry_after` has passed.
    pub fn note_rate_limited(&self, retry_after: Option<Duration>) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state();
        state.refill(now);
        state.tokens = 0.0;
        state.rate_factor = (state.rate_factor * state.settings.backoff_factor).max(state.settings.min_rate_factor);
        if let Some(retry_after) = retry_after {
            let until = now + retry_after;
            state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
        }
        warn!(
            surface = %self.surface,
            effective_rate = state.effective_rate(),
            ?retry_after,
            "upstream rate limit hit, backing off"
        );
    }

    /// A call went through; restore the configured rate if backing off.
    pub fn note_success(&self) {
        let now = Instant::now();
        let mut state = self.state();
        if state.rate_factor < 1.0 {
            state.refill(now);
            state.rate_factor = 1.0;
            info!(surface = %self.surface, rate = state.effective_rate(), "upstream rate restored");
        }
    }

    /// Swap capacity, rate and limits without losing accrued state.
    pub fn reconfigure(&self, settings: GovernorSettings) {
        let now = Instant::now();
        let mut state = self.state();
        if state.settings == settings {
            return;
        }
        state.refill(now);
        state.tokens = state.tokens.min(f64::from(settings.capacity));
        info!(
            surface = %self.surface,
            capacity = settings.capacity,
            refill_per_sec = settings.refill_per_sec,
            "governor reconfigured"
        );
        state.settings = settings;
    }

    pub fn settings(&self) -> GovernorSettings {
        self.state().settings.clone()
    }

    pub fn stats(&self) -> GovernorStats {
        let mut state = self.state();
        state.refill(Instant::now());
        GovernorStats {
            surface: self.surface,
            granted: self.granted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            saturated: self.saturated.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            tokens: state.tokens,
            effective_rate: state.effective_rate(),
        }
    }
}

/// Independent governors, one per upstream surface.
pub struct GovernorSet {
    rest: Arc<UpstreamGovernor>,
    graphql: Arc<UpstreamGovernor>,
}

impl GovernorSet {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            rest: Arc::new(UpstreamGovernor::new(ApiSurface::Rest, config.rest.clone())),
            graphql: Arc::new(UpstreamGovernor::new(ApiSurface::GraphQl, config.graphql.clone())),
        }
    }

    pub fn get(&self, surface: ApiSurface) -> Arc<UpstreamGovernor> {
        match surface {
            ApiSurface::Rest => Arc::clone(&self.rest),
            ApiSurface::GraphQl => Arc::clone(&self.graphql),
        }
    }

    pub fn reconfigure(&self, config: &GovernorConfig) {
        self.rest.reconfigure(config.rest.clone());
        self.graphql.reconfigure(config.graphql.clone());
    }

    pub fn stats(&self) -> Vec<GovernorStats> {
        vec![self.rest.stats(), self.graphql.stats()]
    }
}
