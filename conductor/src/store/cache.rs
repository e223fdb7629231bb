//! Bounded LRU cache with optional per-entry TTL.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Configuration for the read cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether reads and writes go through the cache.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum number of resident entries.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// TTL applied to entries written without an explicit one.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn default_capacity() -> usize {
    256
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_capacity(),
            default_ttl_ms: None,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with caching turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn with_default_ttl_ms(mut self, ttl: u64) -> Self {
        self.default_ttl_ms = Some(ttl);
        self
    }
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Evicted to make room for a new entry.
    Capacity,
    /// Its TTL elapsed.
    Expired,
    /// Removed explicitly.
    Removed,
}

/// Callback invoked after an entry is evicted.
pub type EvictionHook = Arc<dyn Fn(&str, EvictionReason) + Send + Sync>;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries evicted for capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Resident entries.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// `hits / (hits + misses)`, or 0 with no lookups.
    pub hit_rate: f64,
}

struct CacheEntry<V> {
    value: V,
    last_access: Instant,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A thread-safe LRU cache whose entries may expire.
///
/// Expiry is lazy: an expired entry is dropped when it is next looked up,
/// when room is needed for a new entry, or by [`purge_expired`](Self::purge_expired).
pub struct LruTtlCache<V> {
    inner: Mutex<LruCache<String, CacheEntry<V>>>,
    default_ttl: Option<Duration>,
    on_evict: Option<EvictionHook>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V> fmt::Debug for LruTtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruTtlCache")
            .field("len", &self.len())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl<V: Clone> LruTtlCache<V> {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            default_ttl,
            on_evict: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Creates a cache from configuration.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.default_ttl_ms.map(Duration::from_millis))
    }

    /// Registers a hook called for every evicted entry.
    #[must_use]
    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.on_evict = Some(hook);
        self
    }

    /// Returns the value for `key` and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut evicted = None;
        let found = {
            let mut cache = self.inner.lock();
            let outcome = cache.get_mut(key).map(|entry| {
                if entry.is_expired(now) {
                    None
                } else {
                    entry.last_access = now;
                    Some(entry.value.clone())
                }
            });
            match outcome {
                Some(Some(value)) => Some(value),
                Some(None) => {
                    cache.pop(key);
                    evicted = Some((key.to_string(), EvictionReason::Expired));
                    None
                }
                None => None,
            }
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.notify(evicted);
        found
    }

    /// Returns the value for `key` without changing recency or counters.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let cache = self.inner.lock();
        cache
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Inserts `value` with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Inserts `value`, expiring after `ttl` if given.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            last_access: now,
            expires_at: ttl.map(|ttl| now + ttl),
        };

        let mut evicted = Vec::new();
        {
            let mut cache = self.inner.lock();
            if !cache.contains(key.as_str()) && cache.len() >= cache.cap().get() {
                evicted.extend(
                    purge_locked(&mut cache, now)
                        .into_iter()
                        .map(|k| (k, EvictionReason::Expired)),
                );
                if cache.len() >= cache.cap().get() {
                    if let Some((lru_key, _)) = cache.pop_lru() {
                        evicted.push((lru_key, EvictionReason::Capacity));
                    }
                }
            }
            cache.put(key, entry);
        }
        self.notify(evicted);
    }

    /// Removes `key`. Returns true if it was resident.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().pop(key).is_some();
        if removed {
            self.notify(Some((key.to_string(), EvictionReason::Removed)));
        }
        removed
    }

    /// Drops every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let purged = {
            let mut cache = self.inner.lock();
            purge_locked(&mut cache, Instant::now())
        };
        let count = purged.len();
        self.notify(purged.into_iter().map(|k| (k, EvictionReason::Expired)));
        count
    }

    /// Removes every entry without notifying the eviction hook.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Returns the time since `key` was last read or written.
    #[must_use]
    pub fn idle_time(&self, key: &str) -> Option<Duration> {
        self.inner
            .lock()
            .peek(key)
            .map(|entry| entry.last_access.elapsed())
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let (size, capacity) = {
            let cache = self.inner.lock();
            (cache.len(), cache.cap().get())
        };
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size,
            capacity,
            hit_rate,
        }
    }

    fn notify(&self, evicted: impl IntoIterator<Item = (String, EvictionReason)>) {
        for (key, reason) in evicted {
            match reason {
                EvictionReason::Capacity => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                EvictionReason::Expired => {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                }
                EvictionReason::Removed => {}
            }
            debug!(key = %key, reason = ?reason, "Cache entry evicted");
            if let Some(hook) = &self.on_evict {
                hook(&key, reason);
            }
        }
    }
}

impl<V> LruTtlCache<V> {
    /// Returns the number of resident entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no entries are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

fn purge_locked<V>(cache: &mut LruCache<String, CacheEntry<V>>, now: Instant) -> Vec<String> {
    let expired: Vec<String> = cache
        .iter()
        .filter(|(_, entry)| entry.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        cache.pop(key.as_str());
    }
    expired
}
