//! Short-lived key/value cache with per-entry time-to-live.
//!
//! Expiry is evaluated lazily on [`TtlCache::get`]; an optional janitor task
//! sweeps expired entries in the background so keys that are never read again
//! do not pile up.

use dashmap::DashMap;
use std::{
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time::{self, Instant};
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A concurrent TTL cache. Cloning yields another handle to the same entries.
pub struct TtlCache<K, V> {
    inner: Arc<DashMap<K, Entry<V>>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Returns the live value for `key`, dropping it first if it has expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let now = Instant::now();
        // The read guard must be released before `remove_if` takes the shard lock.
        let hit = self
            .inner
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));

        match hit {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.inner.remove_if(key, |_, entry| entry.is_expired(now));
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.inner.insert(key, Entry { value, expires_at });
    }

    /// Number of stored entries, expired ones included until they are purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.len();
        self.inner.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.inner.len())
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a cache whose expired entries are swept every `interval`.
    ///
    /// Must be called from within a tokio runtime. The sweeper holds only a weak
    /// reference and stops once every handle to the cache is gone.
    #[must_use]
    pub fn with_janitor(interval: Duration) -> Self {
        let cache = Self::new();
        let weak = Arc::downgrade(&cache.inner);
        tokio::spawn(janitor(weak, interval));
        cache
    }
}

async fn janitor<K, V>(weak: Weak<DashMap<K, Entry<V>>>, interval: Duration)
where
    K: Eq + Hash,
{
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let cache = TtlCache { inner };
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, remaining = cache.len(), "Purged expired cache entries");
        }
    }
}
