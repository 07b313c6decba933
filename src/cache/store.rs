use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::CacheEntry;
use crate::background::PeriodicTask;

/// In-memory response store keyed by [`cache_key`](super::cache_key).
///
/// Backed by a sharded [`DashMap`]; readers and writers of unrelated keys
/// rarely share a shard lock, and no lock is held while a response body is
/// replayed because entries are handed out as `Arc`s.
///
/// There is no size bound. Every cacheable response body is held in full
/// until it expires.
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    /// Creates an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// TTL applied to entries created by the cache stage.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the live entry for `key`.
    ///
    /// An expired entry is a miss even if no sweep has removed it yet; it is
    /// dropped on the spot.
    pub fn lookup(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let found = self.entries.get(key).map(|e| Arc::clone(e.value()));

        match found {
            Some(entry) if !entry.is_expired() => Some(entry),
            Some(_) => {
                self.entries.remove_if(key, |_, e| e.is_expired());
                None
            }
            None => None,
        }
    }

    /// Stores `entry` under `key`, replacing any previous entry.
    pub fn store(&self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), Arc::new(entry));
    }

    /// Deletes every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired();
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Starts a background task that runs [`sweep`](Self::sweep) every `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> PeriodicTask {
        let cache = Arc::clone(self);
        PeriodicTask::spawn("response-cache-sweep", every, move || {
            let removed = cache.sweep();
            debug!(removed, remaining = cache.len(), "evicted expired cache entries");
        })
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
