//! In-memory TTL cache for API responses.
//!
//! Values are stored as JSON so a single store can hold every response type;
//! typed access goes through [`CacheStore::get`] and [`CacheStore::set`].
//! The cache is an optimization only: every read failure degrades to a miss.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const DEFAULT_MAX_ENTRIES: usize = 1_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<String, CacheEntry>,
    default_ttl: Duration,
    max_entries: usize,
}

impl CacheInner {
    fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn put(&mut self, key: String, value: Value, ttl_override: Option<Duration>) {
        let ttl = ttl_override.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();

        if !self.map.contains_key(&key) && self.map.len() >= self.max_entries {
            self.map.retain(|_, entry| entry.is_fresh(now));
            if self.map.len() >= self.max_entries {
                self.evict_soonest_expiring();
            }
        }

        self.map.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    fn evict_soonest_expiring(&mut self) {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            debug!(key = %key, "cache full; evicting entry closest to expiry");
            self.map.remove(&key);
        }
    }

    fn clear_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_fresh(now));
        before - self.map.len()
    }
}

/// Hit/miss counters and size of a [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Thread-safe in-memory cache shared by the API client and the service.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<tokio::sync::RwLock<CacheInner>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl CacheStore {
    /// Create a new cache store with a default TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_capacity(default_ttl, DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache store holding at most `max_entries` entries.
    pub fn with_capacity(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(CacheInner::new(
                default_ttl,
                max_entries,
            ))),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Raw JSON lookup. Expired entries are evicted and reported as a miss.
    pub async fn get_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let expired = {
            let store = self.inner.read().await;
            match store.map.get(key) {
                Some(entry) if entry.is_fresh(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "cache hit");
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut store = self.inner.write().await;
            let still_expired = store
                .map
                .get(key)
                .is_some_and(|entry| !entry.is_fresh(Instant::now()));
            if still_expired {
                store.map.remove(key);
                debug!(key, "cache entry expired; evicted");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache miss");
        None
    }

    /// Typed lookup. A stored value that no longer matches `T` is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(error) => {
                warn!(key, %error, "cached value does not match requested type; ignoring");
                None
            }
        }
    }

    /// Store a raw JSON value.
    ///
    /// `ttl_override` replaces the default TTL; a zero TTL stores nothing.
    pub async fn put_value(&self, key: String, value: Value, ttl_override: Option<Duration>) {
        let mut store = self.inner.write().await;
        store.put(key, value, ttl_override);
    }

    /// Store a typed value. Serialization failures are logged and dropped.
    pub async fn set<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Option<Duration>) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(json) => self.put_value(key, json, ttl).await,
            Err(error) => warn!(key = %key, %error, "failed to serialize value for cache"),
        }
    }

    /// Pre-load `key` from `loader`. Best effort: failures are logged, never raised.
    ///
    /// Returns whether the key was populated.
    pub async fn warm<T, E, F, Fut>(&self, key: &str, ttl: Option<Duration>, loader: F) -> bool
    where
        T: Serialize,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match loader().await {
            Ok(value) => {
                self.set(key, &value, ttl).await;
                debug!(key, "cache warmed");
                true
            }
            Err(error) => {
                warn!(key, %error, "cache warm-up failed; continuing without it");
                false
            }
        }
    }

    /// Remove a single key. Returns whether an entry was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        let mut store = self.inner.write().await;
        store.map.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut store = self.inner.write().await;
        let before = store.map.len();
        store.map.retain(|key, _| !key.starts_with(prefix));
        before - store.map.len()
    }

    /// Remove expired entries from the cache. Returns the number removed.
    pub async fn clear_expired(&self) -> usize {
        let mut store = self.inner.write().await;
        store.clear_expired()
    }

    /// Clear all entries and reset hit/miss counters.
    pub async fn clear(&self) {
        let mut store = self.inner.write().await;
        store.map.clear();
        drop(store);
        self.reset_metrics();
    }

    /// Get the number of entries in the cache (including expired entries).
    pub async fn len(&self) -> usize {
        let store = self.inner.read().await;
        store.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Change the TTL applied to subsequent writes without an override.
    pub async fn set_default_ttl(&self, default_ttl: Duration) {
        let mut store = self.inner.write().await;
        store.default_ttl = default_ttl;
    }

    pub async fn metrics(&self) -> CacheMetrics {
        let entries = self.len().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        CacheMetrics {
            hits,
            misses,
            entries,
            hit_rate,
        }
    }

    pub fn reset_metrics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
