//! Bounded LRU cache with per-entry expiry for async computations.

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telemetry::Telemetry;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant
}

pub struct AsyncCache<V: Clone> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    ttl: Duration
}

impl<V: Clone> AsyncCache<V> {
    /// A `max_size` of zero is treated as one.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl
        }
    }

    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        Self::new(config.max_size, config.ttl())
    }

    /// Returns a live value and marks it most recently used. Expired entries
    /// are dropped on access.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Inserts a value, evicting the least recently used entry when full.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl
        };
        self.entries.lock().await.put(key.into(), entry);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of stored entries, including expired ones not yet accessed.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the cached result for `name(args)` or computes and stores it.
    ///
    /// Failed computations are not cached. Arguments that cannot be
    /// serialized bypass the cache.
    pub async fn get_or_compute<A, F, Fut, E>(&self, name: &str, args: &A, compute: F) -> Result<V, E>
    where
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>
    {
        let Some(key) = cache_key(name, args) else {
            warn!(name, "Cache key serialization failed, computing uncached");
            return compute().await;
        };

        if let Some(value) = self.get(&key).await {
            Telemetry::record_cache(true);
            debug!(name, "Cache hit");
            return Ok(value);
        }
        Telemetry::record_cache(false);

        let value = compute().await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }
}

/// SHA-256 over the function name and its JSON-encoded arguments. Going
/// through `Value` sorts map keys, so equal maps hash equally.
pub fn cache_key<A: Serialize + ?Sized>(name: &str, args: &A) -> Option<String> {
    let encoded = serde_json::to_vec(&serde_json::to_value(args).ok()?).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(&encoded);
    Some(hex::encode(hasher.finalize()))
}
