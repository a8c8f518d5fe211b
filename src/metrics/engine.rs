//! Engine Metrics
//!
//! Each engine owns its own registry, so several engines in one process (as
//! in tests) never collide on metric names.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::Result;
use crate::store::cache::CacheStats;
use crate::store::journal::EntryKind;

/// Prometheus metrics for one engine instance
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    submitted: IntCounterVec,
    applied: IntCounterVec,
    failed: IntCounterVec,
    queue_depth: IntGauge,
    disk_reads: IntGauge,
    cache_entries: IntGauge,
    cache_bytes: IntGauge,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    cache_evictions: IntGauge,
}

/// Journal counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalCounts {
    /// Entries accepted onto the journal
    pub submitted: u64,
    /// Entries applied successfully
    pub applied: u64,
    /// Entries dropped after a failed apply
    pub failed: u64,
    /// Entries waiting for the applier
    pub queue_depth: u64,
    /// Box files read from disk by read-populate entries
    pub disk_reads: u64,
}

impl EngineMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("kissdb".into()), None)?;

        let submitted = IntCounterVec::new(
            Opts::new("journal_submitted_total", "Journal entries submitted"),
            &["kind"],
        )?;
        let applied = IntCounterVec::new(
            Opts::new("journal_applied_total", "Journal entries applied"),
            &["kind"],
        )?;
        let failed = IntCounterVec::new(
            Opts::new("journal_failed_total", "Journal entries dropped after a failure"),
            &["kind"],
        )?;
        let queue_depth = IntGauge::new("journal_queue_depth", "Journal entries not yet applied")?;
        let disk_reads = IntGauge::new("box_disk_reads_total", "Box files read from disk")?;
        let cache_entries = IntGauge::new("cache_entries", "Boxes held in the cache")?;
        let cache_bytes = IntGauge::new("cache_bytes", "Bytes held in the cache")?;
        let cache_hits = IntGauge::new("cache_hits_total", "Cache read hits")?;
        let cache_misses = IntGauge::new("cache_misses_total", "Cache read misses")?;
        let cache_evictions = IntGauge::new("cache_evictions_total", "Entries evicted by TTL")?;

        registry.register(Box::new(submitted.clone()))?;
        registry.register(Box::new(applied.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(disk_reads.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;

        Ok(Self {
            registry,
            submitted,
            applied,
            failed,
            queue_depth,
            disk_reads,
            cache_entries,
            cache_bytes,
            cache_hits,
            cache_misses,
            cache_evictions,
        })
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an entry placed on the journal
    pub fn record_submitted(&self, kind: EntryKind) {
        self.submitted.with_label_values(&[kind.as_str()]).inc();
        self.queue_depth.inc();
    }

    /// Record an entry applied successfully
    pub fn record_applied(&self, kind: EntryKind) {
        self.applied.with_label_values(&[kind.as_str()]).inc();
        self.queue_depth.dec();
    }

    /// Record an entry dropped after a failure
    pub fn record_failed(&self, kind: EntryKind) {
        self.failed.with_label_values(&[kind.as_str()]).inc();
        self.queue_depth.dec();
    }

    /// Record a box file read from disk
    pub fn record_disk_read(&self) {
        self.disk_reads.inc();
    }

    /// Copy a cache snapshot into the cache gauges
    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_entries.set(stats.entries as i64);
        self.cache_bytes.set(stats.size_bytes as i64);
        self.cache_hits.set(stats.hits as i64);
        self.cache_misses.set(stats.misses as i64);
        self.cache_evictions.set(stats.evictions as i64);
    }

    /// Journal counters summed over every entry kind
    pub fn journal_counts(&self) -> JournalCounts {
        let sum = |vec: &IntCounterVec| -> u64 {
            EntryKind::ALL
                .iter()
                .map(|kind| vec.with_label_values(&[kind.as_str()]).get())
                .sum()
        };

        JournalCounts {
            submitted: sum(&self.submitted),
            applied: sum(&self.applied),
            failed: sum(&self.failed),
            queue_depth: self.queue_depth.get().max(0) as u64,
            disk_reads: self.disk_reads.get().max(0) as u64,
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

// =============================================================================
// Tests
// =============================================================================
