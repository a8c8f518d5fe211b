//! Box Cache
//!
//! In-memory mapping from box path to its last applied value.
//!
//! # Ownership
//!
//! - The journal applier is the only component that stores values
//!   (`put`) or drops them on delete (`remove`, `remove_prefix`)
//! - The evictor only calls `sweep`
//! - Request handlers only call `get`, which refreshes the idle clock
//!
//! Every operation locks a single shard, so the applier and the evictor can
//! never interleave on the same entry.

mod entry;
mod shard;

pub use entry::CacheEntry;
pub use shard::{Shard, ShardedMap};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use super::path::StorePath;

/// Number of shards guarding the cache
pub const CACHE_SHARDS: usize = 16;

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cached boxes
    pub entries: usize,
    /// Total cached bytes
    pub size_bytes: u64,
    /// Read hits
    pub hits: u64,
    /// Read misses
    pub misses: u64,
    /// Entries removed by TTL sweeps
    pub evictions: u64,
}

/// Thread-safe TTL cache of box values
pub struct BoxCache {
    map: ShardedMap<StorePath, CacheEntry, CACHE_SHARDS>,
    origin: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for BoxCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new(),
            origin: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn millis_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_millis() as u64
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        self.millis_at(Instant::now())
    }

    /// Get a value, refreshing its last-accessed time on hit
    pub fn get(&self, path: &StorePath) -> Option<Bytes> {
        let now = self.now_ms();
        let value = self.map.read_with(path, |entry| {
            entry.touch(now);
            entry.value().clone()
        });

        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Get a value without touching statistics or the idle clock
    pub fn peek(&self, path: &StorePath) -> Option<Bytes> {
        self.map.read_with(path, |entry| entry.value().clone())
    }

    /// Insert or overwrite a value, resetting its idle clock
    pub fn put(&self, path: StorePath, value: Bytes) {
        let entry = CacheEntry::new(value, self.now_ms());
        self.map.insert(path, entry);
    }

    /// Remove a single box; returns true if it was cached
    pub fn remove(&self, path: &StorePath) -> bool {
        self.map.remove(path).is_some()
    }

    /// Remove `path` and every box beneath it; returns the number removed
    pub fn remove_prefix(&self, path: &StorePath) -> usize {
        self.map
            .retain(|key, _| key != path && !path.is_ancestor_of(key))
    }

    /// Remove every entry idle longer than `ttl` as of `now`
    pub fn sweep(&self, ttl: Duration, now: Instant) -> usize {
        let ttl_ms = ttl.as_millis() as u64;
        let now_ms = self.millis_at(now);
        let removed = self.map.retain(|_, entry| !entry.is_idle(ttl_ms, now_ms));
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Check if a box is cached
    pub fn contains(&self, path: &StorePath) -> bool {
        self.map.contains_key(path)
    }

    /// Number of cached boxes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total cached bytes
    pub fn size_bytes(&self) -> u64 {
        self.map
            .shards()
            .map(|shard| shard.fold(0, |acc, _, entry| acc + entry.size()))
            .sum()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            size_bytes: self.size_bytes(),
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn box_path(name: &str) -> StorePath {
        StorePath::boxed("shop", "orders", name).unwrap()
    }

    #[test]
    fn test_put_get() {
        let cache = BoxCache::new();
        assert!(cache.is_empty());

        cache.put(box_path("order1"), Bytes::from("{\"qty\":2}"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 9);
        assert_eq!(
            cache.get(&box_path("order1")).unwrap().as_ref(),
            b"{\"qty\":2}"
        );
        assert!(cache.get(&box_path("order2")).is_none());

        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_put_overwrites() {
        let cache = BoxCache::new();
        cache.put(box_path("order1"), Bytes::from("a"));
        cache.put(box_path("order1"), Bytes::from("b"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&box_path("order1")).unwrap().as_ref(), b"b");
    }

    #[test]
    fn test_peek_does_not_count() {
        let cache = BoxCache::new();
        cache.put(box_path("order1"), Bytes::from("a"));
        cache.peek(&box_path("order1"));
        cache.peek(&box_path("missing"));
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_remove_prefix() {
        let cache = BoxCache::new();
        cache.put(box_path("order1"), Bytes::from("1"));
        cache.put(box_path("order2"), Bytes::from("2"));
        cache.put(
            StorePath::boxed("shop", "customers", "c1").unwrap(),
            Bytes::from("c"),
        );
        cache.put(
            StorePath::boxed("shopping", "orders", "o").unwrap(),
            Bytes::from("x"),
        );

        let removed = cache.remove_prefix(&StorePath::table("shop", "orders").unwrap());
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 2);

        let removed = cache.remove_prefix(&StorePath::database("shop").unwrap());
        assert_eq!(removed, 1);
        assert!(cache.contains(&StorePath::boxed("shopping", "orders", "o").unwrap()));

        assert!(cache.remove(&StorePath::boxed("shopping", "orders", "o").unwrap()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_removes_idle_entries() {
        let cache = BoxCache::new();
        cache.put(box_path("order1"), Bytes::from("1"));

        let ttl = Duration::from_secs(300);
        let now = Instant::now();

        assert_eq!(cache.sweep(ttl, now + Duration::from_secs(299)), 0);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.sweep(ttl, now + Duration::from_secs(301)), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_get_refreshes_idle_clock() {
        let cache = BoxCache::new();
        cache.put(box_path("hot"), Bytes::from("h"));
        cache.put(box_path("cold"), Bytes::from("c"));

        std::thread::sleep(Duration::from_millis(30));
        cache.get(&box_path("hot"));

        // both were written ~30ms ago, only "hot" was read since
        let removed = cache.sweep(Duration::from_millis(20), Instant::now());
        assert_eq!(removed, 1);
        assert!(cache.contains(&box_path("hot")));
        assert!(!cache.contains(&box_path("cold")));
    }

    #[test]
    fn test_stats() {
        let cache = BoxCache::new();
        cache.put(box_path("order1"), Bytes::from("data"));
        cache.get(&box_path("order1"));
        cache.get(&box_path("nope"));

        let stats = cache.stats();
        assert_eq!(
            stats,
            CacheStats {
                entries: 1,
                size_bytes: 4,
                hits: 1,
                misses: 1,
                evictions: 0,
            }
        );
    }

    #[test]
    fn test_concurrent_readers_and_sweeper() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(BoxCache::new());
        for i in 0..64 {
            cache.put(box_path(&format!("o{}", i)), Bytes::from(vec![i as u8; 8]));
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..64 {
                        if let Some(v) = cache.get(&box_path(&format!("o{}", i))) {
                            assert_eq!(v.len(), 8);
                        }
                    }
                })
            })
            .collect();

        let sweeper = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.sweep(Duration::ZERO, Instant::now() + Duration::from_secs(1)))
        };

        for reader in readers {
            reader.join().unwrap();
        }
        sweeper.join().unwrap();
        assert!(cache.len() <= 64);
    }
}
