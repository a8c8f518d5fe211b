//! KissDB - Journaled Hierarchical Key-Value Store
//!
//! Values ("boxes") live under a fixed three-level namespace:
//! database → table → box. Each box is one file under
//! `<data>/db/<database>/<table>/<box>`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          kissdb daemon                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    HTTP      │───▶│    Engine    │───▶│   Journal    │       │
//! │  │  front-end   │    │   (facade)   │    │   Applier    │       │
//! │  └──────────────┘    └──────┬───────┘    └──────┬───────┘       │
//! │                             │ hit               │ put           │
//! │                      ┌──────▼───────────────────▼──────┐        │
//! │                      │   Box cache  ◀── sweep ── Evictor│        │
//! │                      └─────────────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes and deletes are acknowledged once journaled and applied in the
//! background, in submission order. Reads are served from the cache or block
//! until the applier has populated it.
//!
//! # Modules
//!
//! - [`config`] - Daemon file and engine settings
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`server`] - HTTP front-end
//! - [`store`] - Path resolution, journal, applier, cache and engine facade

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use config::{DaemonConfig, EngineConfig};
pub use error::{Error, ErrorKind, Result};
pub use store::{DeleteAllSummary, Engine, EngineStats, Level, StorePath};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
