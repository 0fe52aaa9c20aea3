//! Weak-reference LRU cache with a memory bound
//!
//! **Why**: Decoded images and derived bands are large and recomputable.
//! Holding them weakly means the cache never keeps an artifact alive on its
//! own — once the last owner drops its `Arc`, the next lookup is a miss and
//! the slot is purged. The bound is expressed in MB of accounted payload,
//! not entry count, so one 50 MB frame weighs what it costs.
//!
//! **Used by**: AdaptiveLoader (admission and lookup), BatchRunner (clear
//! between runs)
//!
//! # Eviction
//!
//! Admission happens first; if accounted size then exceeds `max_mb`, LRU
//! entries are popped until usage is at or below 0.8 * max_mb. The hysteresis
//! gap keeps back-to-back admissions from evicting on every call.
//!
//! # Locking
//!
//! One coarse `Mutex` around the whole map. Operations are map lookups and
//! float arithmetic, never decodes, so contention stays negligible next to
//! image work.

use std::sync::{Arc, Mutex, Weak};

use log::debug;
use lru::LruCache;

use crate::buffer::MemSize;
use crate::telemetry::BYTES_PER_MB;

/// Post-overflow eviction target as a fraction of the bound.
const EVICTION_HYSTERESIS: f64 = 0.8;

struct CacheEntry<T> {
    value: Weak<T>,
    size_mb: f64,
}

struct CacheInner<T> {
    entries: LruCache<String, CacheEntry<T>>,
    used_mb: f64,
}

/// Point-in-time cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub count: usize,
    pub used_mb: f64,
    pub max_mb: f64,
}

/// Size-bounded weak-reference LRU cache, keyed by string.
pub struct BoundedCache<T> {
    inner: Mutex<CacheInner<T>>,
    max_mb: f64,
}

impl<T: MemSize> BoundedCache<T> {
    /// Create a cache bounded at `max_mb` MB of accounted payload.
    pub fn new(max_mb: f64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                // Count is unbounded; the memory accounting below is the limit
                entries: LruCache::unbounded(),
                used_mb: 0.0,
            }),
            max_mb,
        }
    }

    /// Admit a value under `key`, replacing any previous entry.
    ///
    /// Size defaults to `value.mem()` in MB; `size_mb` overrides it for
    /// payloads whose `mem()` undercounts (composite artifacts). Eviction
    /// runs after admission, so even an oversized value is admitted first and
    /// only neighbors are evicted.
    pub fn put(&self, key: &str, value: &Arc<T>, size_mb: Option<f64>) {
        let size = size_mb.unwrap_or_else(|| value.mem() as f64 / BYTES_PER_MB);
        let mut inner = self.inner.lock().unwrap();

        if let Some(old) = inner.entries.pop(key) {
            inner.used_mb -= old.size_mb;
        }
        inner.entries.put(
            key.to_string(),
            CacheEntry {
                value: Arc::downgrade(value),
                size_mb: size,
            },
        );
        inner.used_mb += size;

        if inner.used_mb > self.max_mb {
            let target = self.max_mb * EVICTION_HYSTERESIS;
            while inner.used_mb > target {
                match inner.entries.pop_lru() {
                    Some((evicted_key, entry)) => {
                        inner.used_mb -= entry.size_mb;
                        debug!("evicted '{}' ({:.2} MB)", evicted_key, entry.size_mb);
                    }
                    None => break,
                }
            }
            debug!(
                "eviction done: {} entries, {:.2}/{:.2} MB",
                inner.entries.len(),
                inner.used_mb,
                self.max_mb
            );
        }
    }

    /// Look up and promote. A dead weak reference (last owner gone) is
    /// purged and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(key)?;
        match entry.value.upgrade() {
            Some(value) => Some(value),
            None => {
                if let Some(dead) = inner.entries.pop(key) {
                    inner.used_mb -= dead.size_mb;
                }
                debug!("purged expired entry '{}'", key);
                None
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.used_mb -= entry.size_mb;
                true
            }
            None => false,
        }
    }

    /// Drop every entry and reset accounting.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.used_mb = 0.0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            count: inner.entries.len(),
            used_mb: inner.used_mb,
            max_mb: self.max_mb,
        }
    }
}

impl<T> std::fmt::Debug for BoundedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BoundedCache")
            .field("count", &inner.entries.len())
            .field("used_mb", &inner.used_mb)
            .field("max_mb", &self.max_mb)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mb(n: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0u8; n * 1_000_000])
    }

    /// Test: Put and get
    /// Validates: Hit returns the same allocation, stats track usage
    #[test]
    fn test_put_get() {
        let cache: BoundedCache<Vec<u8>> = BoundedCache::new(10.0);
        let v = mb(2);
        cache.put("a", &v, None);

        let hit = cache.get("a").unwrap();
        assert!(Arc::ptr_eq(&hit, &v));

        let stats = cache.stats();
        assert_eq!(stats.count, 1);
        assert!((stats.used_mb - 2.0).abs() < 1e-9);
        assert_eq!(stats.max_mb, 10.0);
    }

    /// Test: Memory-bounded eviction
    /// Validates: Usage never exceeds the bound after put, hysteresis target
    #[test]
    fn test_eviction_bound() {
        let cache: BoundedCache<Vec<u8>> = BoundedCache::new(2.0);
        // Owners kept alive so weak expiry never interferes with accounting
        let owners: Vec<_> = (0..5).map(|_| mb(1)).collect();

        for (i, v) in owners.iter().enumerate() {
            cache.put(&format!("e{}", i), v, None);
            assert!(cache.stats().used_mb <= 2.0 + 1e-9);
        }

        // Third put overflowed to 3 MB then evicted down to <= 1.6 MB, and so on
        let stats = cache.stats();
        assert!(stats.count <= 2);
        assert!(stats.used_mb <= 2.0 * 0.8 + 1e-9);
        // Most recent entry survives every eviction round
        assert!(cache.get("e4").is_some());
    }

    /// Test: Weak expiry
    /// Validates: Dropping the last owner turns the entry into a purged miss
    #[test]
    fn test_weak_expiry() {
        let cache: BoundedCache<Vec<u8>> = BoundedCache::new(10.0);
        let v = mb(1);
        cache.put("a", &v, None);
        assert!(cache.get("a").is_some());

        drop(v);
        assert!(cache.get("a").is_none());

        // Purge reclaimed the accounting
        let stats = cache.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.used_mb, 0.0);
    }

    /// Test: Size override and replacement
    /// Validates: Explicit size wins, re-put under a key swaps the accounting
    #[test]
    fn test_size_override_and_replace() {
        let cache: BoundedCache<Vec<u8>> = BoundedCache::new(100.0);
        let v = mb(1);

        cache.put("a", &v, Some(5.0));
        assert!((cache.stats().used_mb - 5.0).abs() < 1e-9);

        cache.put("a", &v, Some(1.0));
        let stats = cache.stats();
        assert_eq!(stats.count, 1);
        assert!((stats.used_mb - 1.0).abs() < 1e-9);
    }

    /// Test: Remove and clear
    /// Validates: Accounting returns to zero
    #[test]
    fn test_remove_clear() {
        let cache: BoundedCache<Vec<u8>> = BoundedCache::new(10.0);
        let a = mb(1);
        let b = mb(2);
        cache.put("a", &a, None);
        cache.put("b", &b, None);

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!((cache.stats().used_mb - 2.0).abs() < 1e-9);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.used_mb, 0.0);
        assert!(cache.get("b").is_none());
    }

    /// Test: LRU promotion
    /// Validates: get() refreshes recency, so the untouched entry evicts first
    #[test]
    fn test_lru_promotion() {
        let cache: BoundedCache<Vec<u8>> = BoundedCache::new(2.0);
        let a = mb(1);
        let b = mb(1);
        let c = mb(2);

        cache.put("a", &a, None);
        cache.put("b", &b, None);
        // Promote "a"; "b" becomes least recent
        assert!(cache.get("a").is_some());

        cache.put("c", &c, None);
        assert!(cache.get("b").is_none());
    }

    /// Test: Concurrent access
    /// Validates: Coarse lock keeps parallel put/get consistent
    #[test]
    fn test_concurrent_access() {
        let cache: Arc<BoundedCache<Vec<u8>>> = Arc::new(BoundedCache::new(50.0));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..20 {
                        let key = format!("t{}-{}", t, i);
                        let v = mb(1);
                        cache.put(&key, &v, None);
                        // Owner alive on this stack frame: must be a hit
                        assert!(cache.get(&key).is_some());
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.stats().used_mb <= 50.0 + 1e-9);
    }
}
