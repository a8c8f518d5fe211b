//! Journaled Hierarchical Store
//!
//! A three-level namespace (database → table → box) persisted as directories
//! and files under `<data>/db`, fronted by an in-memory box cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Engine (facade)                          │
//! │   validate ─▶ resolve (disk + pending) ─▶ submit ─▶ return      │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 │ JournalEntry (FIFO)           │ cache hit
//!                 ▼                               │
//! ┌───────────────────────────────┐     ┌─────────┴───────────────┐
//! │           Applier             │────▶│        BoxCache          │
//! │  mkdir / write+rename / rm    │ put │  16 shards, last-access  │
//! │  read-populate for waiters    │     └─────────▲───────────────┘
//! └───────────────┬───────────────┘               │ sweep
//!                 ▼                     ┌─────────┴───────────────┐
//!           <data>/db/...               │      CacheEvictor        │
//!                                       └─────────────────────────┘
//! ```
//!
//! Mutations are acknowledged once enqueued. A read of a path with pending
//! mutations is queued behind them, so a caller always observes its own
//! earlier writes.

pub mod applier;
pub mod cache;
pub mod engine;
pub mod evictor;
pub mod journal;
pub mod path;
pub mod resolver;

pub use cache::{BoxCache, CacheStats};
pub use engine::{DeleteAllSummary, Engine, EngineStats};
pub use journal::{EntryKind, Journal, JournalEntry, JournalOp};
pub use path::{Level, StorePath, MAX_DEPTH};
pub use resolver::{PathResolver, Resolution};
