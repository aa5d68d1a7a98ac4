//! TTL-bounded cache for upstream responses
//!
//! Entries expire lazily: a read that finds an expired entry removes it
//! (compare-and-remove) and reports a miss. There is no background sweeper;
//! the map is instead bounded by a maximum entry count, enforced on insert.

use crate::models::Cacheable;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default upper bound on cached entries per cache instance
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// A cached value and its expiry deadline
#[derive(Debug)]
pub struct CacheEntry<T> {
    value: Arc<T>,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: Arc<T>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// True once the deadline has been reached
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Concurrent TTL cache keyed by [`Cacheable::cache_key`]
pub struct Cache<T> {
    entries: DashMap<String, CacheEntry<T>>,
    max_entries: usize,
}

impl<T: Cacheable> Cache<T> {
    /// Create an empty cache with the default entry cap
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create an empty cache holding at most `max_entries` values
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Store a value for `ttl`, replacing whatever was stored under its key
    pub fn cache(&self, value: T, ttl: Duration) -> Arc<T> {
        let value = Arc::new(value);
        let key = value.cache_key();

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }

        self.entries
            .insert(key, CacheEntry::new(Arc::clone(&value), ttl));
        value
    }

    /// Return the value for `key` if present and still fresh
    pub fn is_cached(&self, key: &str) -> Option<Arc<T>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.expired() {
                return Some(Arc::clone(&entry.value));
            }
        } else {
            return None;
        }

        // Guard dropped above; only remove if the entry is still the expired one
        self.entries.remove_if(key, |_, entry| entry.expired());
        None
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired());
        before.saturating_sub(self.entries.len())
    }

    /// Drop a single entry regardless of expiry
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self) {
        let swept = self.sweep();
        if self.entries.len() < self.max_entries {
            debug!(swept, "Cache swept expired entries");
            return;
        }

        // Still full: evict the entries closest to expiry
        let overflow = self.entries.len() + 1 - self.max_entries;
        let mut by_deadline: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().expires_at))
            .collect();
        by_deadline.sort_by_key(|(_, deadline)| *deadline);

        for (key, _) in by_deadline.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
        debug!(swept, evicted = overflow, "Cache evicted entries to stay bounded");
    }
}

impl<T: Cacheable> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}
