//! Cache Evictor
//!
//! Periodic sweep that drops cache entries idle longer than the box TTL.
//! Eviction never touches disk: the next read re-populates through the journal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::metrics::EngineMetrics;

use super::cache::BoxCache;

/// Background TTL sweeper for the box cache
pub struct CacheEvictor {
    cache: Arc<BoxCache>,
    metrics: Arc<EngineMetrics>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl CacheEvictor {
    /// Create an evictor
    pub fn new(
        cache: Arc<BoxCache>,
        metrics: Arc<EngineMetrics>,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            cache,
            metrics,
            ttl,
            sweep_interval,
        }
    }

    /// Sweep once as of `now`; returns the number of evicted entries
    pub fn sweep_at(&self, now: Instant) -> usize {
        let evicted = self.cache.sweep(self.ttl, now);
        self.metrics.observe_cache(&self.cache.stats());
        evicted
    }

    /// Run until cancelled
    #[instrument(skip_all, name = "evictor")]
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            ttl_secs = self.ttl.as_secs_f64(),
            interval_ms = self.sweep_interval.as_millis() as u64,
            "Cache evictor started"
        );

        let mut tick = interval(self.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let evicted = self.sweep_at(Instant::now());
                    if evicted > 0 {
                        debug!(evicted, remaining = self.cache.len(), "Evicted idle boxes");
                    }
                }

                _ = cancel.cancelled() => break,
            }
        }

        info!("Cache evictor finished");
    }
}

// =============================================================================
// Tests
// =============================================================================
