//! Journal Applier
//!
//! The only task that writes the filesystem and the only task that stores
//! values in the cache. Entries are applied strictly in the order they were
//! received.
//!
//! # Apply rules
//!
//! - Write: database/table → create directory; box → temp file + rename,
//!   then cache put. Disk always lands before the cache.
//! - Read: reply from the cache if already populated, else read the file and
//!   populate the cache.
//! - Delete: remove the file or directory tree, then drop the path and every
//!   cached box beneath it.
//!
//! Failures are logged and the entry is dropped. There is no retry.

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

use super::cache::BoxCache;
use super::journal::{Journal, JournalEntry, JournalOp, JournalReceiver, ReadFailure, ReadOutcome};
use super::path::{Level, StorePath};
use super::resolver::{PathResolver, Resolution};

/// Single consumer of the journal
pub struct Applier {
    rx: JournalReceiver,
    journal: Arc<Journal>,
    cache: Arc<BoxCache>,
    resolver: PathResolver,
    metrics: Arc<EngineMetrics>,
}

impl Applier {
    /// Create the applier for a journal
    pub fn new(
        rx: JournalReceiver,
        journal: Arc<Journal>,
        cache: Arc<BoxCache>,
        resolver: PathResolver,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            rx,
            journal,
            cache,
            resolver,
            metrics,
        }
    }

    /// Run until cancelled, then drain what is already queued
    #[instrument(skip_all, name = "applier")]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(root = %self.resolver.root().display(), "Journal applier started");

        loop {
            tokio::select! {
                biased;

                entry = self.rx.recv() => match entry {
                    Some(entry) => self.apply(entry).await,
                    None => break,
                },

                _ = cancel.cancelled() => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(entry) = self.rx.recv().await {
                        self.apply(entry).await;
                        drained += 1;
                    }
                    if drained > 0 {
                        info!(drained, "Drained journal before shutdown");
                    }
                    break;
                }
            }
        }

        let abandoned = self.journal.abandon_readers();
        if abandoned > 0 {
            warn!(abandoned, "Readers still waiting at shutdown");
        }
        info!("Journal applier finished");
    }

    /// Apply one entry
    pub async fn apply(&self, entry: JournalEntry) {
        let JournalEntry {
            sequence,
            submitted_at,
            op,
        } = entry;
        let kind = op.kind();
        debug!(sequence, kind = %kind, submitted_at = %submitted_at, "Applying journal entry");

        let ok = match op {
            JournalOp::Write { path, value } => {
                let result = self.apply_write(&path, value).await;
                self.journal.complete(&path, sequence);
                self.report(sequence, &path, "write", result)
            }
            JournalOp::Delete { path } => {
                let result = self.apply_delete(&path).await;
                self.journal.complete(&path, sequence);
                self.report(sequence, &path, "delete", result)
            }
            JournalOp::Read { path } => {
                let outcome = self.apply_read(&path).await;
                if let Err(failure) = &outcome {
                    warn!(sequence, path = %path, ?failure, "Read-populate failed");
                }
                let ok = outcome.is_ok();
                let readers = self.journal.finish_read(&path, sequence, &outcome);
                debug!(sequence, path = %path, readers, "Read-populate delivered");
                ok
            }
            JournalOp::Sync { done } => {
                let _ = done.send(());
                true
            }
        };

        if ok {
            self.metrics.record_applied(kind);
        } else {
            self.metrics.record_failed(kind);
        }
    }

    fn report(&self, sequence: u64, path: &StorePath, action: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                // the caller was already told "accepted"; the log is the only trace
                error!(sequence, path = %path, action, error = %e, "Journal entry dropped");
                false
            }
        }
    }

    async fn apply_write(&self, path: &StorePath, value: Bytes) -> Result<()> {
        let target = path.to_fs_path(self.resolver.root());

        match path.level() {
            Level::Database | Level::Table => {
                fs::create_dir(&target).await.or_else(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists && target.is_dir() {
                        Ok(())
                    } else {
                        Err(e)
                    }
                })?;
            }
            Level::Box => {
                write_atomic(&target, &value).await?;
                self.cache.put(path.clone(), value);
            }
        }
        Ok(())
    }

    async fn apply_read(&self, path: &StorePath) -> ReadOutcome {
        if let Some(value) = self.cache.peek(path) {
            return Ok(value);
        }

        let target = path.to_fs_path(self.resolver.root());
        match fs::read(&target).await {
            Ok(data) => {
                self.metrics.record_disk_read();
                let value = Bytes::from(data);
                self.cache.put(path.clone(), value.clone());
                Ok(value)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let level = match self.resolver.resolve(path) {
                    Resolution::NotFound(level) => level,
                    Resolution::Exists => Level::Box,
                };
                Err(ReadFailure::Missing(level))
            }
            Err(e) => Err(ReadFailure::Internal(format!(
                "Failed to read box {}: {}",
                path, e
            ))),
        }
    }

    async fn apply_delete(&self, path: &StorePath) -> Result<()> {
        let target = path.to_fs_path(self.resolver.root());

        let removed = match path.level() {
            Level::Box => fs::remove_file(&target).await,
            Level::Database | Level::Table => fs::remove_dir_all(&target).await,
        };

        // delete is authoritative for the cache even if the disk was already clean
        let evicted = match path.level() {
            Level::Box => usize::from(self.cache.remove(path)),
            Level::Database | Level::Table => self.cache.remove_prefix(path),
        };
        debug!(path = %path, evicted, "Dropped cached boxes");

        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path, "Delete target already gone");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Write `data` to a hidden sibling temp file, then rename it over `target`
async fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", target.display())))?;
    let name = target
        .file_name()
        .ok_or_else(|| Error::Internal(format!("{} has no file name", target.display())))?;
    let temp = parent.join(format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, target).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp).await;
        return Err(Error::Io(e));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
