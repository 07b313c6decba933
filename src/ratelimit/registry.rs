//! Per-client bucket registry with idle eviction.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::TokenBucket;
use crate::background::PeriodicTask;

/// Maps client identifiers to their token buckets.
///
/// # Locking
///
/// The map is a [`DashMap`]: keys are spread over independently locked shards,
/// so two clients only contend when they hash to the same shard, and only for
/// the duration of a lookup or insert. The shard lock is released before the
/// caller touches the bucket; token math is serialized by the bucket's own
/// lock. The periodic sweep takes the same shard locks one at a time.
///
/// A sweep can race with a request for a client that is just crossing the
/// idle threshold. The worst case is that the client's next request creates a
/// fresh, full bucket.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientEntry>,
    refill_rate: f64,
    burst: f64,
}

#[derive(Debug)]
struct ClientEntry {
    bucket: Arc<TokenBucket>,
    last_seen: Instant,
}

impl ClientRegistry {
    /// Creates an empty registry. Buckets it creates regain `refill_rate`
    /// tokens per second and hold at most `burst`.
    pub fn new(refill_rate: f64, burst: f64) -> Self {
        Self {
            clients: DashMap::new(),
            refill_rate,
            burst,
        }
    }

    /// Returns the bucket for `client`, creating a full one on first sight.
    ///
    /// Refreshes the client's last-seen time either way. Concurrent first
    /// requests from the same client all receive the same bucket.
    pub fn get_or_create(&self, client: &str) -> Arc<TokenBucket> {
        let now = Instant::now();

        if let Some(mut entry) = self.clients.get_mut(client) {
            entry.last_seen = now;
            return Arc::clone(&entry.bucket);
        }

        let mut entry = self
            .clients
            .entry(client.to_owned())
            .or_insert_with(|| ClientEntry {
                bucket: Arc::new(TokenBucket::new(self.refill_rate, self.burst)),
                last_seen: now,
            });
        entry.last_seen = now;
        Arc::clone(&entry.bucket)
    }

    /// Removes every client not seen for longer than `idle`.
    ///
    /// Returns the number of clients removed.
    pub fn sweep(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.clients.retain(|_, entry| {
            let keep = now.saturating_duration_since(entry.last_seen) <= idle;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Starts a background task that runs [`sweep`](Self::sweep) with `idle`
    /// every `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, idle: Duration) -> PeriodicTask {
        let registry = Arc::clone(self);
        PeriodicTask::spawn("client-registry-sweep", every, move || {
            let removed = registry.sweep(idle);
            debug!(removed, remaining = registry.len(), "evicted idle clients");
        })
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` when no client is tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Returns `true` if `client` currently has a bucket.
    pub fn contains(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }
}
