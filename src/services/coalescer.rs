//! Request coalescer: one in-flight upstream fetch per key.
//!
//! The first caller for a key becomes the owner and its fetch runs in a
//! spawned task. Later callers for the same key attach to a `watch` channel
//! and receive the owner's single result or single error. Dropping any
//! caller, the owner included, only detaches that caller; the fetch always
//! runs to completion. The registry entry is removed when the task ends,
//! even on panic, so a failure never poisons later requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::domain::errors::{SyncError, SyncResult};

type Slot<V> = watch::Receiver<Option<SyncResult<V>>>;
type Registry<V> = Arc<Mutex<HashMap<String, Slot<V>>>>;

fn lock<V>(registry: &Registry<V>) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry when the fetch task finishes or unwinds.
struct PendingGuard<V> {
    registry: Registry<V>,
    key: String,
}

impl<V> Drop for PendingGuard<V> {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Callers that started a fetch.
    pub owners: u64,
    /// Callers that attached to someone else's fetch.
    pub joined: u64,
    pub in_flight: usize,
}

pub struct RequestCoalescer<V> {
    pending: Registry<V>,
    owners: AtomicU64,
    joined: AtomicU64,
}

impl<V> Default for RequestCoalescer<V> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            owners: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> RequestCoalescer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key` unless a fetch for it is already in flight, and
    /// return the shared result either way.
    ///
    /// `fetch` is only called by the owner.
    pub async fn request<F, Fut>(&self, key: &str, fetch: F) -> SyncResult<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = SyncResult<V>> + Send + 'static,
    {
        let (mut rx, tx) = {
            let mut pending = lock(&self.pending);
            if let Some(rx) = pending.get(key) {
                self.joined.fetch_add(1, Ordering::Relaxed);
                trace!(key, "joined in-flight fetch");
                (rx.clone(), None)
            } else {
                let (tx, rx) = watch::channel(None);
                pending.insert(key.to_string(), rx.clone());
                self.owners.fetch_add(1, Ordering::Relaxed);
                (rx, Some(tx))
            }
        };

        if let Some(tx) = tx {
            debug!(key, "starting coalesced fetch");
            let guard = PendingGuard {
                registry: Arc::clone(&self.pending),
                key: key.to_string(),
            };
            let fut = fetch();
            tokio::spawn(async move {
                let guard = guard;
                let result = fut.await;
                // Release the key first so a caller arriving now starts clean.
                drop(guard);
                // Receivers may all be gone; the owner's side effects still happened.
                let _ = tx.send(Some(result));
            });
        }

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(SyncError::UpstreamUnavailable(format!(
                    "fetch for '{key}' ended without a result"
                )));
            }
        }
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            owners: self.owners.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            in_flight: lock(&self.pending).len(),
        }
    }
}
