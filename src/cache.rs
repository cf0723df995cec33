//! Response caching with TTL for adapter execution results
//!
//! Thread-safe TTL cache keyed by request fingerprint. A key is
//! `{instance}:{operation}:{digest}` where the digest is the SHA-256 of the
//! canonical JSON of `[actor, instance, operation, params]`. Canonical JSON
//! sorts object keys at every level, so parameter order never changes the
//! key while any value difference does. The actor component scopes entries
//! to the caller; pass `None` to share entries across actors.
//!
//! Writes are per-key atomic (`DashMap`), reads never block writes to other
//! keys, and expired entries are evicted lazily by the read that touches
//! them. Whether a response may be stored at all is the caller's decision;
//! the cache never inspects operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Thread-safe response cache with TTL expiry
pub struct ResponseCache {
    /// Cache entries keyed by `instance:operation:fingerprint`
    entries: DashMap<String, CacheEntry>,
    /// Cache statistics
    stats: CacheStats,
    /// Entry count bound; reaching it evicts the entry closest to expiry
    max_entries: usize,
}

/// A cached response with TTL metadata
struct CacheEntry {
    /// The cached JSON value
    value: Value,
    /// When this entry was stored
    stored_at: Instant,
    /// Time-to-live duration
    ttl: Duration,
    /// Times this entry was served
    hits: AtomicU64,
}

impl CacheEntry {
    /// Check if this entry has expired
    fn is_expired(&self) -> bool {
        Instant::now().duration_since(self.stored_at) > self.ttl
    }

    /// Moment this entry stops being servable
    fn expires_at(&self) -> Instant {
        self.stored_at + self.ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug)]
pub struct CacheStats {
    /// Total cache hits (entries served from cache)
    pub hits: AtomicU64,
    /// Total cache misses (entries not found or expired)
    pub misses: AtomicU64,
    /// Total evictions (expired or displaced entries removed)
    pub evictions: AtomicU64,
    /// Total entries stored
    pub insertions: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
        }
    }

    /// Get current cache hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get current cache miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get current insertion count
    pub fn insertions(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl ResponseCache {
    /// Create an empty cache bounded to `max_entries`
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached response if it exists and hasn't expired
    ///
    /// Returns `None` if the key doesn't exist or the entry has expired.
    /// Expired entries are evicted by the read that touches them.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a value under `key` with the given TTL
    ///
    /// A zero TTL means "do not cache" and is ignored. Storing over an
    /// existing key replaces it atomically. At capacity, the entry closest
    /// to expiry is displaced first.
    pub fn put(&self, key: &str, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let full = self.entries.len() >= self.max_entries && !self.entries.contains_key(key);
        if full && self.evict_expired() == 0 {
            self.evict_soonest();
        }

        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl,
            hits: AtomicU64::new(0),
        };
        self.entries.insert(key.to_string(), entry);
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one key. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every key with the given prefix (e.g. `"{instance}:"` when an
    /// instance is destroyed). Returns the number of entries removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            insertions: self.stats.insertions(),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Build a cache key from the caller, instance, operation, and parameters
    ///
    /// The key format is `{instance}:{operation}:{digest}`. The digest covers
    /// the actor (when given), the instance, the operation, and the full
    /// canonical parameter set, so no two materially different requests share
    /// a key. The `{instance}:` prefix exists so an instance's entries can be
    /// dropped wholesale with [`ResponseCache::invalidate_prefix`].
    #[must_use]
    pub fn build_key(actor: Option<&str>, instance: &str, operation: &str, params: &Value) -> String {
        let digest = Self::fingerprint(actor, instance, operation, params);
        format!("{instance}:{operation}:{digest}")
    }

    /// SHA-256 over the canonical JSON of the full request identity
    fn fingerprint(actor: Option<&str>, instance: &str, operation: &str, params: &Value) -> String {
        let composite = serde_json::json!([actor, instance, operation, params]);
        // Canonical JSON: object keys sorted at every level
        let canonical = serde_json::to_string(&composite).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        format!("{result:x}")
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Evict expired entries (maintenance sweep). Returns the count removed.
    pub fn evict_expired(&self) -> usize {
        let keys_to_remove: Vec<String> = self
            .entries
            .iter()
            .filter_map(|entry| {
                if entry.value().is_expired() {
                    Some(entry.key().clone())
                } else {
                    None
                }
            })
            .collect();

        let count = keys_to_remove.len();
        for key in keys_to_remove {
            self.entries.remove(&key);
        }

        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Displace the entry closest to expiry (capacity pressure)
    fn evict_soonest(&self) {
        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at())
            .map(|entry| entry.key().clone());

        if let Some(key) = soonest {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Total insertions
    pub insertions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
