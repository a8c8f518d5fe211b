//! Cache Entry Types

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Cached box value with its idle clock.
///
/// `last_accessed` is stored as milliseconds since the owning cache's origin
/// instant, so a read hit can refresh it under a shared lock.
#[derive(Debug)]
pub struct CacheEntry {
    value: Bytes,
    last_accessed: AtomicU64,
}

impl CacheEntry {
    /// Create an entry last accessed at `now_ms`
    pub fn new(value: Bytes, now_ms: u64) -> Self {
        Self {
            value,
            last_accessed: AtomicU64::new(now_ms),
        }
    }

    /// Get the value (zero-copy)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Value size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.value.len() as u64
    }

    /// Record an access at `now_ms`
    #[inline]
    pub fn touch(&self, now_ms: u64) {
        self.last_accessed.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Last access, in milliseconds since the cache origin
    #[inline]
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// True if the entry has been idle longer than `ttl_ms` at `now_ms`
    #[inline]
    pub fn is_idle(&self, ttl_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_accessed()) > ttl_ms
    }
}
