//! Bounded query cache with TTL.
//!
//! Keys are a content fingerprint over the normalized query, the requested
//! `top_k`, the sorted ids of the sources that produced the answer, and the
//! store's document count at answer time. Folding the source ids and the
//! count into the key means any relevant store mutation changes the
//! fingerprint, so stale answers fall out without explicit invalidation.
//! A hit skips embedding, retrieval, and generation entirely.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Default TTL for cached answers.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default maximum cache entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Cache key combining query parameters with a store-content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Whitespace-normalized, lowercased query text
    pub normalized_query: String,
    /// Requested result count
    pub top_k: usize,
    /// Sorted ids of the sources behind the answer
    pub source_ids: Vec<String>,
    /// Store document count at answer time
    pub store_count: usize,
}

impl CacheKey {
    /// Build a key, normalizing the query and sorting the source ids.
    #[must_use]
    pub fn new(query: &str, top_k: usize, mut source_ids: Vec<String>, store_count: usize) -> Self {
        source_ids.sort();
        Self {
            normalized_query: normalize_query(query),
            top_k,
            source_ids,
            store_count,
        }
    }

    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        Hash::hash(self, &mut hasher);
        hasher.finish()
    }
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    cached_at: Instant,
    ttl: Duration,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions (capacity and expiry)
    pub evictions: u64,
    /// Total explicit invalidations
    pub invalidations: u64,
    /// Current entry count
    pub size: usize,
    /// Configured capacity
    pub capacity: usize,
}

impl CacheMetrics {
    /// Hit rate in [0, 1].
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU query cache with per-entry TTL. Values are whatever response shape
/// the caller wants to memoize.
pub struct QueryCache<V: Clone> {
    cache: RwLock<LruCache<u64, CachedEntry<V>>>,
    metrics: RwLock<CacheMetrics>,
    default_ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> QueryCache<V> {
    /// Cache with default capacity and TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_MAX_ENTRIES, DEFAULT_CACHE_TTL)
    }

    /// Cache with explicit capacity and TTL.
    #[must_use]
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let cache = LruCache::new(
            NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero")),
        );
        Self {
            cache: RwLock::new(cache),
            metrics: RwLock::new(CacheMetrics {
                capacity,
                ..CacheMetrics::default()
            }),
            default_ttl: ttl,
            max_entries: capacity,
        }
    }

    /// Look up a cached value.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let fingerprint = key.fingerprint();
        let mut cache = self
            .cache
            .write()
            .expect("QueryCache: cache lock poisoned - this indicates a panic in cache code");
        let mut metrics = self
            .metrics
            .write()
            .expect("QueryCache: metrics lock poisoned - this indicates a panic in metrics tracking");

        match cache.get(&fingerprint) {
            Some(entry) if entry.is_expired() => {
                cache.pop(&fingerprint);
                metrics.misses += 1;
                metrics.evictions += 1;
                metrics.size = cache.len();
                None
            }
            Some(entry) => {
                metrics.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                metrics.misses += 1;
                None
            }
        }
    }

    /// Insert a value under `key`.
    pub fn put(&self, key: &CacheKey, value: V) {
        let fingerprint = key.fingerprint();
        let entry = CachedEntry {
            value,
            cached_at: Instant::now(),
            ttl: self.default_ttl,
        };

        let mut cache = self
            .cache
            .write()
            .expect("QueryCache: cache lock poisoned - this indicates a panic in cache code");
        let mut metrics = self
            .metrics
            .write()
            .expect("QueryCache: metrics lock poisoned - this indicates a panic in metrics tracking");

        if cache.len() >= self.max_entries && !cache.contains(&fingerprint) {
            metrics.evictions += 1;
        }
        cache.put(fingerprint, entry);
        metrics.size = cache.len();
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        let mut cache = self
            .cache
            .write()
            .expect("QueryCache: cache lock poisoned - this indicates a panic in cache code");
        let mut metrics = self
            .metrics
            .write()
            .expect("QueryCache: metrics lock poisoned - this indicates a panic in metrics tracking");
        let size = cache.len();
        cache.clear();
        metrics.invalidations += size as u64;
        metrics.size = 0;
    }

    /// Snapshot of the metrics.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
            .read()
            .expect("QueryCache: metrics lock poisoned - this indicates a panic in metrics tracking")
            .clone()
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache
            .read()
            .expect("QueryCache: cache lock poisoned - this indicates a panic in cache code")
            .len()
    }

    /// True when no entries are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
