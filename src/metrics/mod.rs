//! Metrics module
//!
//! Per-engine Prometheus metrics for the journal and the box cache.

mod engine;

pub use engine::{EngineMetrics, JournalCounts};
