//! TTL cache with an explicit tag index for group invalidation.
//!
//! Entries live in a `moka` cache. Each entry carries its own TTL; moka keeps
//! it around for an extra `stale_retention` so the serve-stale path still has
//! something to return when upstream is out of budget. Tag membership is kept
//! in a separate index rather than relying on key pattern matching, so
//! `invalidate("products")` works the same for any backend.

use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::models::CacheConfig;

/// A cached value with its freshness window.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub ttl: Duration,
    pub tags: Vec<String>,
}

impl<V> CacheEntry<V> {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }

    /// Time left before the entry goes stale; zero once it has.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }
}

/// Snapshot of tag generations taken before a fetch starts.
///
/// A fill carrying a ticket is dropped if any of its tags was invalidated
/// after the snapshot, so a slow fetch cannot resurrect data an
/// invalidation already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTicket {
    tags: Vec<(String, u64)>,
}

impl CacheTicket {
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|(t, _)| t.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub dropped_fills: u64,
    pub entries: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    dropped_fills: AtomicU64,
}

#[derive(Default)]
struct TagIndex {
    keys_by_tag: HashMap<String, HashSet<String>>,
    generations: HashMap<String, u64>,
}

impl TagIndex {
    fn generation(&self, tag: &str) -> u64 {
        self.generations.get(tag).copied().unwrap_or(0)
    }
}

struct EntryExpiry {
    stale_retention: Duration,
}

impl<V> Expiry<String, Arc<CacheEntry<V>>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry<V>>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl.saturating_add(self.stale_retention))
    }

    fn expire_after_update(
        &self,
        key: &String,
        value: &Arc<CacheEntry<V>>,
        updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.expire_after_create(key, value, updated_at)
    }
}

/// Tag-indexed TTL cache.
pub struct CacheManager<V> {
    entries: Cache<String, Arc<CacheEntry<V>>>,
    index: Mutex<TagIndex>,
    counters: Counters,
}

impl<V: Clone + Send + Sync + 'static> CacheManager<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.max_entries, config.stale_retention())
    }

    pub fn with_limits(max_entries: u64, stale_retention: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry { stale_retention })
            .build();
        Self {
            entries,
            index: Mutex::new(TagIndex::default()),
            counters: Counters::default(),
        }
    }

    fn index(&self) -> MutexGuard<'_, TagIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, or `None` on a miss or an expired entry.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_age(key).map(|(value, _)| value)
    }

    /// Fresh value for `key` together with its age.
    pub fn get_with_age(&self, key: &str) -> Option<(V, Duration)> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.value.clone(), entry.age()))
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Any retained value for `key`, fresh or past its TTL, with its age.
    pub fn get_stale(&self, key: &str) -> Option<(V, Duration)> {
        let entry = self.entries.get(key)?;
        self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        Some((entry.value.clone(), entry.age()))
    }

    /// Remaining freshness of `key`, `None` if absent or already stale.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|e| e.is_fresh())
            .map(|e| e.remaining())
    }

    /// Store unconditionally under the given tags.
    pub fn set(&self, key: &str, value: V, ttl: Duration, tags: &[String]) {
        if ttl.is_zero() {
            return;
        }
        let mut index = self.index();
        self.insert_locked(&mut index, key, value, ttl, tags.to_vec());
    }

    /// Snapshot the generations of `tags` before starting a fetch.
    pub fn ticket(&self, tags: &[String]) -> CacheTicket {
        let index = self.index();
        CacheTicket {
            tags: tags.iter().map(|t| (t.clone(), index.generation(t))).collect(),
        }
    }

    /// Store only if none of the ticket's tags were invalidated since it was
    /// issued. Returns whether the value was stored.
    pub fn set_with_ticket(&self, key: &str, value: V, ttl: Duration, ticket: &CacheTicket) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let mut index = self.index();
        if ticket.tags.iter().any(|(tag, gen)| index.generation(tag) != *gen) {
            self.counters.dropped_fills.fetch_add(1, Ordering::Relaxed);
            debug!(key, "dropped cache fill invalidated during fetch");
            return false;
        }
        let tags = ticket.tags.iter().map(|(t, _)| t.clone()).collect();
        self.insert_locked(&mut index, key, value, ttl, tags);
        true
    }

    fn insert_locked(&self, index: &mut TagIndex, key: &str, value: V, ttl: Duration, tags: Vec<String>) {
        for tag in &tags {
            index
                .keys_by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
            tags,
        };
        self.entries.insert(key.to_string(), Arc::new(entry));
    }

    /// Remove every entry tagged `tag`. Returns the number of keys dropped.
    ///
    /// Also bumps the tag's generation so in-flight ticketed fills for it are
    /// discarded.
    pub fn invalidate(&self, tag: &str) -> usize {
        let mut index = self.index();
        *index.generations.entry(tag.to_string()).or_insert(0) += 1;
        let keys = index.keys_by_tag.remove(tag).unwrap_or_default();
        for key in &keys {
            self.entries.invalidate(key);
        }
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(tag, removed = keys.len(), "cache tag invalidated");
        keys.len()
    }

    pub fn invalidate_key(&self, key: &str) {
        let _index = self.index();
        self.entries.invalidate(key);
    }

    /// Drop index members whose entries moka has already evicted.
    pub fn sweep_index(&self) -> usize {
        let mut index = self.index();
        let mut pruned = 0;
        index.keys_by_tag.retain(|_, keys| {
            let before = keys.len();
            keys.retain(|k| self.entries.contains_key(k));
            pruned += before - keys.len();
            !keys.is_empty()
        });
        pruned
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            dropped_fills: self.counters.dropped_fills.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
        }
    }
}
