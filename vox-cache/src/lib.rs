//! # VoxCache
//!
//! In-memory caching layer shared by the provider adapter and the queue
//! store. Each distinct key type gets its own `moka` future cache with its
//! own capacity and TTL, mirroring the per-entity cache split used for
//! provider data, but generalized to a single generic `ProviderCache<V>` so
//! each crate instantiates only the shapes it needs instead of carrying a
//! bespoke struct per provider.

use moka::future::Cache as MokaCache;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vox_config::CacheConfig;

/// A single-shape cache keyed by `String`, with a runtime enable/disable
/// switch. When disabled, `get` always misses and `put` is a no-op — this
/// backs the `USE_CACHE=false` escape hatch without changing call sites.
#[derive(Clone)]
pub struct KeyCache<V: Clone + Send + Sync + 'static> {
    inner: MokaCache<String, V>,
    enabled: Arc<AtomicBool>,
}

impl<V: Clone + Send + Sync + 'static> KeyCache<V> {
    pub fn new(max_capacity: u64, ttl: Duration, enabled: bool) -> Self {
        Self {
            inner: MokaCache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        self.inner.get(key).await
    }

    pub async fn put(&self, key: impl Into<String>, value: V) {
        if !self.is_enabled() {
            return;
        }
        self.inner.insert(key.into(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    pub async fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }

    /// Fetches `key`, populating from `compute` on miss. `compute` is only
    /// invoked once per miss; concurrent callers on the same key may both
    /// run it (single-flight dedup is the caller's responsibility when that
    /// matters, see the provider adapter's rotor-session lock).
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.put(key.to_string(), value.clone()).await;
        Ok(value)
    }
}

/// Spawns the periodic cleanup tick described for the provider cache: every
/// `interval` it checks the entry count and, once it exceeds `threshold`,
/// clears the cache entirely rather than relying purely on TTL eviction.
/// Returns a handle whose `abort()` stops the tick; dropping the handle also
/// stops it.
pub fn spawn_cleanup_tick<V: Clone + Send + Sync + 'static>(
    cache: KeyCache<V>,
    interval: Duration,
    threshold: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let count = cache.entry_count().await;
            if count > threshold {
                tracing::debug!(count, threshold, "cache cleanup: clearing, over threshold");
                cache.invalidate_all();
            }
        }
    })
}

/// Convenience constructor for a `KeyCache` sized from `CacheConfig`.
pub fn from_config<V: Clone + Send + Sync + 'static>(config: &CacheConfig, enabled: bool) -> KeyCache<V> {
    KeyCache::new(config.max_entries, config.ttl, enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_get_put_invalidate() {
        let cache: KeyCache<String> = KeyCache::new(100, Duration::from_secs(60), true);
        cache.put("a", "hello".to_string()).await;
        assert_eq!(cache.get("a").await, Some("hello".to_string()));
        cache.invalidate("a").await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let cache: KeyCache<String> = KeyCache::new(100, Duration::from_secs(60), false);
        cache.put("a", "hello".to_string()).await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn entry_count_reflects_inserts() {
        let cache: KeyCache<u32> = KeyCache::new(100, Duration::from_secs(60), true);
        cache.put("x", 1).await;
        cache.put("y", 2).await;
        assert_eq!(cache.entry_count().await, 2);
    }

    #[tokio::test]
    async fn get_or_compute_populates_on_miss() {
        let cache: KeyCache<u32> = KeyCache::new(100, Duration::from_secs(60), true);
        let v: Result<u32, ()> = cache.get_or_compute("k", || async { Ok(42) }).await;
        assert_eq!(v, Ok(42));
        assert_eq!(cache.get("k").await, Some(42));
    }
}
