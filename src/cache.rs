//! Bounded TTL cache shared by the key resolver and the token validator
//!
//! Entries carry an absolute expiry taken from the injected clock. Expired
//! entries are evicted lazily on read and in bulk by [`TtlCache::evict_expired`].
//! When the cache is over capacity the oldest *inserted* entry goes first.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: AtomicU64,
    /// Lookups not found or expired
    pub misses: AtomicU64,
    /// Entries removed by expiry or capacity
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Current hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Current miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate (0.0-1.0)
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

/// Snapshot of cache statistics
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    seq: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Insertion order; stale `(key, seq)` pairs are skipped on eviction
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Thread-safe bounded cache with per-entry expiry
pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    stats: CacheStats,
}

impl<V: Clone> TtlCache<V> {
    /// Create an empty cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Cached value for `key` unless it expired at `now`.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                inner.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether `key` is cached and unexpired, without touching the stats.
    pub fn contains(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| now < e.expires_at)
    }

    /// Store `value` until `expires_at`, evicting the oldest entries if full.
    pub fn insert(&self, key: &str, value: V, expires_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
        inner.order.push_back((key.to_string(), seq));

        while inner.entries.len() > self.capacity {
            let Some((oldest, oldest_seq)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&oldest).is_some_and(|e| e.seq == oldest_seq) {
                inner.entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if inner.order.len() > self.capacity.saturating_mul(2) {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, s)| entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    /// Drop one entry.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().entries.remove(key).map(|e| e.value)
    }

    /// Evict entries expired at `now`. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| now < e.expires_at);
        let count = before - inner.entries.len();

        if count > 0 {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, s)| entries.get(k).is_some_and(|e| e.seq == *s));
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Clear all entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Current number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            size: self.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

/// SHA-256 hex digest of `parts`, each length-prefixed so boundaries are unambiguous.
#[must_use]
pub fn digest_key(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_cache_hit() {
        let cache = TtlCache::new(10);
        let now = Utc::now();
        cache.insert("k", "v".to_string(), now + Duration::seconds(60));

        assert_eq!(cache.get("k", now), Some("v".to_string()));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_cache_miss() {
        let cache: TtlCache<String> = TtlCache::new(10);
        assert_eq!(cache.get("nonexistent", Utc::now()), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_cache_expiry_on_read() {
        let cache = TtlCache::new(10);
        let now = Utc::now();
        cache.insert("k", 1, now + Duration::seconds(1));

        assert_eq!(cache.get("k", now + Duration::seconds(1)), None);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_inserted() {
        let cache = TtlCache::new(2);
        let now = Utc::now();
        let later = now + Duration::hours(1);
        cache.insert("a", 1, later);
        cache.insert("b", 2, later);
        // reading "a" does not protect it
        assert_eq!(cache.get("a", now), Some(1));
        cache.insert("c", 3, later);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a", now), None);
        assert_eq!(cache.get("b", now), Some(2));
        assert_eq!(cache.get("c", now), Some(3));
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let cache = TtlCache::new(2);
        let now = Utc::now();
        let later = now + Duration::hours(1);
        cache.insert("a", 1, later);
        cache.insert("b", 2, later);
        cache.insert("a", 10, later);
        cache.insert("c", 3, later);

        assert_eq!(cache.get("b", now), None);
        assert_eq!(cache.get("a", now), Some(10));
    }

    #[test]
    fn test_evict_expired() {
        let cache = TtlCache::new(10);
        let now = Utc::now();
        cache.insert("short", 1, now + Duration::seconds(1));
        cache.insert("long", 2, now + Duration::hours(1));

        assert_eq!(cache.evict_expired(now + Duration::seconds(2)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_digest_key_is_boundary_safe() {
        assert_ne!(digest_key(&[b"ab", b"c"]), digest_key(&[b"a", b"bc"]));
        assert_eq!(digest_key(&[b"x"]).len(), 64);
    }
}
