//! Storage Engine Facade
//!
//! The operation surface request handlers call. Validation and existence
//! checks fail fast before anything is enqueued; accepted mutations return as
//! soon as they are on the journal.
//!
//! # Per-path states
//!
//! ```text
//! Absent ──create/update──▶ Cached(value) ──delete──▶ Absent
//! Absent ──read miss──▶ PendingRead ──applied──▶ Cached(value) | Failed
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::{EngineMetrics, JournalCounts};

use super::applier::Applier;
use super::cache::{BoxCache, CacheStats};
use super::evictor::CacheEvictor;
use super::journal::{Journal, JournalOp, PendingState, ReadOutcome};
use super::path::{Level, StorePath};
use super::resolver::{PathResolver, Resolution};

/// Point-in-time engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Cache statistics
    pub cache: CacheStats,
    /// Journal counters
    pub journal: JournalCounts,
    /// Paths with mutations not yet applied
    pub pending_paths: usize,
    /// Paths with readers blocked on a read-populate
    pub waiting_paths: usize,
}

/// Outcome of deleting every database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteAllSummary {
    /// Databases present on disk or pending creation
    pub total: usize,
    /// Deletes accepted onto the journal
    pub deleted: usize,
}

impl DeleteAllSummary {
    /// True when every database was deleted
    pub fn is_complete(&self) -> bool {
        self.deleted == self.total
    }
}

struct EngineInner {
    config: EngineConfig,
    resolver: PathResolver,
    cache: Arc<BoxCache>,
    journal: Arc<Journal>,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Journaled storage engine. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Validate `config`, prepare the data directory and spawn the applier
    /// and evictor. Must be called from within a tokio runtime.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let db_root = config.db_root();
        tokio::fs::create_dir_all(&db_root).await?;

        let metrics = Arc::new(EngineMetrics::new()?);
        let cache = Arc::new(BoxCache::new());
        let resolver = PathResolver::new(db_root);
        let (journal, rx) = Journal::new(metrics.clone());
        let journal = Arc::new(journal);
        let cancel = CancellationToken::new();

        let applier = Applier::new(
            rx,
            journal.clone(),
            cache.clone(),
            resolver.clone(),
            metrics.clone(),
        );
        let evictor = CacheEvictor::new(
            cache.clone(),
            metrics.clone(),
            config.box_cache_ttl,
            config.sweep_interval,
        );

        let workers = vec![
            tokio::spawn(applier.run(cancel.clone())),
            tokio::spawn(evictor.run(cancel.clone())),
        ];

        let databases = count_dirs(resolver.root()).await?;
        info!(
            root = %resolver.root().display(),
            databases,
            ttl_secs = config.box_cache_ttl.as_secs(),
            "Storage engine started"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                resolver,
                cache,
                journal,
                metrics,
                cancel,
                workers: Mutex::new(workers),
            }),
        })
    }

    /// Stop intake, let the applier drain the journal and wait for both workers
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.journal.close();
        self.inner.cancel.cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            worker
                .await
                .map_err(|e| Error::Internal(format!("Engine worker panicked: {}", e)))?;
        }

        info!("Storage engine stopped");
        Ok(())
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Path resolver over this engine's data root
    pub fn resolver(&self) -> &PathResolver {
        &self.inner.resolver
    }

    /// The box cache
    pub fn cache(&self) -> &BoxCache {
        &self.inner.cache
    }

    /// Prometheus metrics for this engine
    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a database, table or box.
    ///
    /// Fails with `AlreadyExists` if the path exists, or `NotFound` naming the
    /// missing parent. The value is ignored for databases and tables.
    #[instrument(skip_all, fields(path = %path))]
    pub fn create(&self, path: &StorePath, value: impl Into<Bytes>) -> Result<()> {
        let mut journal = self.inner.journal.lock();

        match self.inner.resolver.resolve_pending(path, journal.pending()) {
            Resolution::Exists => return Err(Error::AlreadyExists(path.level())),
            Resolution::NotFound(level) if level != path.level() => {
                return Err(Error::NotFound(level));
            }
            Resolution::NotFound(_) => {}
        }

        let sequence = journal.submit(JournalOp::Write {
            path: path.clone(),
            value: value.into(),
        })?;
        debug!(sequence, "Create accepted");
        Ok(())
    }

    /// Replace the value of an existing box
    #[instrument(skip_all, fields(path = %path))]
    pub fn update(&self, path: &StorePath, value: impl Into<Bytes>) -> Result<()> {
        path.require_box()?;
        let mut journal = self.inner.journal.lock();

        self.inner
            .resolver
            .resolve_pending(path, journal.pending())
            .into_result()?;

        let sequence = journal.submit(JournalOp::Write {
            path: path.clone(),
            value: value.into(),
        })?;
        debug!(sequence, "Update accepted");
        Ok(())
    }

    /// Delete a database, table or box (containers with everything beneath)
    #[instrument(skip_all, fields(path = %path))]
    pub fn delete(&self, path: &StorePath) -> Result<()> {
        let mut journal = self.inner.journal.lock();

        self.inner
            .resolver
            .resolve_pending(path, journal.pending())
            .into_result()?;

        let sequence = journal.submit(JournalOp::Delete { path: path.clone() })?;
        debug!(sequence, "Delete accepted");
        Ok(())
    }

    /// Delete every database, including those whose create is still queued
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<DeleteAllSummary> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.delete_all_locked())
            .await
            .map_err(|e| Error::Internal(format!("Delete-all task failed: {}", e)))?
    }

    /// Candidates and submissions share one journal lock, so no create or
    /// delete can land between listing and enqueueing.
    fn delete_all_locked(&self) -> Result<DeleteAllSummary> {
        let mut journal = self.inner.journal.lock();

        let mut names: BTreeSet<String> = disk_databases(self.inner.resolver.root())?;
        for (path, state) in journal.pending().iter() {
            if path.level() != Level::Database {
                continue;
            }
            match state {
                PendingState::Present { .. } => names.insert(path.name().to_string()),
                PendingState::Absent { .. } => names.remove(path.name()),
            };
        }

        let mut summary = DeleteAllSummary {
            total: names.len(),
            deleted: 0,
        };
        for name in names {
            let path = match StorePath::database(name.as_str()) {
                Ok(path) => path,
                Err(e) => {
                    warn!(database = %name, error = %e, "Skipping unaddressable database");
                    continue;
                }
            };
            let submitted = self
                .inner
                .resolver
                .resolve_pending(&path, journal.pending())
                .into_result()
                .and_then(|()| journal.submit(JournalOp::Delete { path }));
            match submitted {
                Ok(sequence) => {
                    debug!(sequence, database = %name, "Delete accepted");
                    summary.deleted += 1;
                }
                Err(e) => error!(database = %name, error = %e, "Failed to delete database"),
            }
        }
        Ok(summary)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a box.
    ///
    /// Served from the cache when neither the path nor an ancestor has a
    /// pending mutation; otherwise waits for a read-populate entry queued
    /// behind those mutations, bounded by the request timeout.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn read(&self, path: &StorePath) -> Result<Bytes> {
        path.require_box()?;

        if let Some(value) = self.cached(path) {
            return Ok(value);
        }

        // the existence check stats the disk
        let engine = self.clone();
        let target = path.clone();
        let waiter = tokio::task::spawn_blocking(move || engine.enqueue_read(&target))
            .await
            .map_err(|e| Error::Internal(format!("Read task failed: {}", e)))??;

        let limit = self.inner.config.request_timeout;
        match timeout(limit, waiter).await {
            Ok(Ok(outcome)) => outcome.map_err(Error::from),
            Ok(Err(_)) => Err(Error::Internal(
                "Journal applier stopped before the read completed.".into(),
            )),
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Read timed out");
                Err(Error::Timeout(limit))
            }
        }
    }

    /// A cached box with nothing pending above it is known to exist on disk
    fn cached(&self, path: &StorePath) -> Option<Bytes> {
        let settled = self
            .inner
            .journal
            .lock()
            .pending()
            .latest_sequence(path)
            .is_none();
        if settled {
            self.inner.cache.get(path)
        } else {
            None
        }
    }

    fn enqueue_read(&self, path: &StorePath) -> Result<oneshot::Receiver<ReadOutcome>> {
        let mut journal = self.inner.journal.lock();
        self.inner
            .resolver
            .resolve_pending(path, journal.pending())
            .into_result()?;
        journal.await_read(path)
    }

    /// Database names, sorted
    pub async fn list_databases(&self) -> Result<Vec<String>> {
        list_entries(self.inner.resolver.root(), EntryFilter::Dirs).await
    }

    /// Table names in a database, sorted
    pub async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        self.list(&StorePath::database(database)?).await
    }

    /// Box names in a table, sorted
    pub async fn list_boxes(&self, database: &str, table: &str) -> Result<Vec<String>> {
        self.list(&StorePath::table(database, table)?).await
    }

    /// List the children of a database or table directly from disk
    pub async fn list(&self, path: &StorePath) -> Result<Vec<String>> {
        let filter = match path.level() {
            Level::Database => EntryFilter::Dirs,
            Level::Table => EntryFilter::Files,
            Level::Box => {
                return Err(Error::InvalidPath(format!(
                    "'{}' is a box and cannot be listed.",
                    path
                )))
            }
        };

        self.inner.resolver.resolve(path).into_result()?;
        list_entries(&path.to_fs_path(self.inner.resolver.root()), filter).await
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Wait until every entry submitted before this call has been applied
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner
            .journal
            .lock()
            .submit(JournalOp::Sync { done: tx })?;
        rx.await
            .map_err(|_| Error::Internal("Journal applier stopped before sync.".into()))
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        let cache = self.inner.cache.stats();
        self.inner.metrics.observe_cache(&cache);
        EngineStats {
            cache,
            journal: self.inner.metrics.journal_counts(),
            pending_paths: self.inner.journal.pending_paths(),
            waiting_paths: self.inner.journal.waiting_paths(),
        }
    }

    /// Prometheus text exposition for this engine
    pub fn render_metrics(&self) -> Result<String> {
        self.inner.metrics.observe_cache(&self.inner.cache.stats());
        self.inner.metrics.encode()
    }
}

#[derive(Clone, Copy)]
enum EntryFilter {
    Dirs,
    Files,
}

/// Sorted, non-hidden directory entries of one kind
async fn list_entries(dir: &std::path::Path, filter: EntryFilter) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().await?;
        let wanted = match filter {
            EntryFilter::Dirs => file_type.is_dir(),
            EntryFilter::Files => file_type.is_file(),
        };
        if wanted {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

/// Database directories on disk; runs under the journal lock
fn disk_databases(root: &std::path::Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && entry.file_type()?.is_dir() {
            names.insert(name);
        }
    }
    Ok(names)
}

async fn count_dirs(dir: &std::path::Path) -> Result<usize> {
    Ok(list_entries(dir, EntryFilter::Dirs).await?.len())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(EngineConfig::new(dir.path())).await.unwrap();
        (dir, engine)
    }

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_create_checks_parents_and_duplicates() {
        let (_dir, engine) = engine().await;

        assert_matches!(
            engine.create(&path("shop/orders"), ""),
            Err(Error::NotFound(Level::Database))
        );

        engine.create(&path("shop"), "").unwrap();
        assert_matches!(
            engine.create(&path("shop"), ""),
            Err(Error::AlreadyExists(Level::Database))
        );

        engine.create(&path("shop/orders"), "").unwrap();
        engine.create(&path("shop/orders/order1"), "1").unwrap();
        assert_matches!(
            engine.create(&path("shop/orders/order1"), "2"),
            Err(Error::AlreadyExists(Level::Box))
        );

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_and_delete_require_existence() {
        let (_dir, engine) = engine().await;

        assert_matches!(
            engine.update(&path("shop/orders/order1"), "x"),
            Err(Error::NotFound(Level::Database))
        );
        assert_matches!(
            engine.delete(&path("shop")),
            Err(Error::NotFound(Level::Database))
        );
        assert_matches!(
            engine.update(&path("shop/orders"), "x"),
            Err(Error::InvalidPath(_))
        );

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_your_writes_without_sync() {
        let (_dir, engine) = engine().await;

        engine.create(&path("shop"), "").unwrap();
        engine.create(&path("shop/orders"), "").unwrap();
        engine.create(&path("shop/orders/order1"), "a").unwrap();
        engine.update(&path("shop/orders/order1"), "b").unwrap();

        assert_eq!(engine.read(&path("shop/orders/order1")).await.unwrap(), "b");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_hit_after_populate() {
        let (_dir, engine) = engine().await;
        engine.create(&path("shop"), "").unwrap();
        engine.create(&path("shop/orders"), "").unwrap();
        engine.create(&path("shop/orders/order1"), "v").unwrap();
        engine.sync().await.unwrap();

        let before = engine.stats().cache.hits;
        assert_eq!(engine.read(&path("shop/orders/order1")).await.unwrap(), "v");
        assert_eq!(engine.stats().cache.hits, before + 1);
        assert_eq!(engine.stats().journal.disk_reads, 0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_hides_temp_files() {
        let (dir, engine) = engine().await;
        engine.create(&path("zeta"), "").unwrap();
        engine.create(&path("alpha"), "").unwrap();
        engine.create(&path("alpha/t"), "").unwrap();
        engine.create(&path("alpha/t/b2"), "").unwrap();
        engine.create(&path("alpha/t/b1"), "").unwrap();
        engine.sync().await.unwrap();

        std::fs::write(dir.path().join("db/alpha/t/.b3.tmp"), b"partial").unwrap();

        assert_eq!(engine.list_databases().await.unwrap(), vec!["alpha", "zeta"]);
        assert_eq!(engine.list_tables("alpha").await.unwrap(), vec!["t"]);
        assert_eq!(engine.list_boxes("alpha", "t").await.unwrap(), vec!["b1", "b2"]);
        assert_matches!(
            engine.list_boxes("alpha", "missing").await,
            Err(Error::NotFound(Level::Table))
        );
        assert_matches!(
            engine.list(&path("alpha/t/b1")).await,
            Err(Error::InvalidPath(_))
        );

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_all() {
        let (_dir, engine) = engine().await;
        engine.create(&path("a"), "").unwrap();
        engine.create(&path("b"), "").unwrap();
        engine.sync().await.unwrap();

        let summary = engine.delete_all().await.unwrap();
        assert_eq!(summary, DeleteAllSummary { total: 2, deleted: 2 });
        assert!(summary.is_complete());
        engine.sync().await.unwrap();
        assert!(engine.list_databases().await.unwrap().is_empty());

        engine.shutdown().await.unwrap();
    }

    /// Engine whose journal is never applied; the receiver is kept alive
    fn stalled_engine(root: &std::path::Path, limit: Duration) -> (Engine, crate::store::journal::JournalReceiver) {
        let config = EngineConfig {
            request_timeout: limit,
            ..EngineConfig::new(root)
        };
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let (journal, rx) = Journal::new(metrics.clone());
        let engine = Engine {
            inner: Arc::new(EngineInner {
                resolver: PathResolver::new(config.db_root()),
                config,
                cache: Arc::new(BoxCache::new()),
                journal: Arc::new(journal),
                metrics,
                cancel: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        };
        (engine, rx)
    }

    /// Start applying a stalled engine's journal
    fn resume(engine: &Engine, rx: crate::store::journal::JournalReceiver) {
        let inner = &engine.inner;
        let applier = Applier::new(
            rx,
            inner.journal.clone(),
            inner.cache.clone(),
            inner.resolver.clone(),
            inner.metrics.clone(),
        );
        let worker = tokio::spawn(applier.run(inner.cancel.clone()));
        inner.workers.lock().push(worker);
    }

    async fn wait_for_readers(engine: &Engine, count: usize) {
        let waiting = async {
            while engine.inner.journal.waiting_readers() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(Duration::from_secs(5), waiting).await.unwrap();
    }

    fn spawn_read(engine: &Engine, target: &StorePath) -> JoinHandle<Result<Bytes>> {
        let engine = engine.clone();
        let target = target.clone();
        tokio::spawn(async move { engine.read(&target).await })
    }

    #[tokio::test]
    async fn test_read_after_update_sees_update_despite_inflight_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db/shop/orders")).unwrap();
        std::fs::write(dir.path().join("db/shop/orders/order1"), b"a").unwrap();
        let target = path("shop/orders/order1");

        let (engine, rx) = stalled_engine(dir.path(), Duration::from_secs(5));
        let cold = spawn_read(&engine, &target);
        wait_for_readers(&engine, 1).await;

        engine.update(&target, "b").unwrap();
        let later = spawn_read(&engine, &target);
        wait_for_readers(&engine, 2).await;

        resume(&engine, rx);
        assert_eq!(cold.await.unwrap().unwrap(), "a");
        assert_eq!(later.await.unwrap().unwrap(), "b");
        assert_eq!(engine.cache().peek(&target).unwrap(), "b");
        assert_eq!(engine.stats().waiting_paths, 0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_all_includes_unapplied_creates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db/mall")).unwrap();
        std::fs::create_dir_all(dir.path().join("db/old")).unwrap();

        let (engine, rx) = stalled_engine(dir.path(), Duration::from_secs(5));
        engine.create(&path("shop"), "").unwrap();
        engine.delete(&path("old")).unwrap();

        let summary = engine.delete_all().await.unwrap();
        assert_eq!(summary, DeleteAllSummary { total: 2, deleted: 2 });

        resume(&engine, rx);
        engine.sync().await.unwrap();
        assert!(engine.list_databases().await.unwrap().is_empty());
        assert_eq!(engine.stats().pending_paths, 0);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_skips_disk_checks() {
        let (dir, engine) = engine().await;
        let target = path("shop/orders/order1");
        engine.create(&path("shop"), "").unwrap();
        engine.create(&path("shop/orders"), "").unwrap();
        engine.create(&target, "v").unwrap();
        engine.sync().await.unwrap();

        // a hit with nothing pending never consults the disk
        std::fs::remove_dir_all(dir.path().join("db/shop")).unwrap();
        assert_eq!(engine.read(&target).await.unwrap(), "v");

        // a pending delete of an ancestor bypasses the cache
        std::fs::create_dir_all(dir.path().join("db/shop/orders")).unwrap();
        engine.delete(&path("shop")).unwrap();
        assert_matches!(engine.read(&target).await, Err(Error::NotFound(Level::Database)));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_times_out_when_nothing_applies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db/shop/orders")).unwrap();
        std::fs::write(dir.path().join("db/shop/orders/order1"), b"v").unwrap();

        let (engine, mut rx) = stalled_engine(dir.path(), Duration::from_millis(50));
        let result = engine.read(&path("shop/orders/order1")).await;
        assert_matches!(result, Err(Error::Timeout(_)));

        // the read-populate entry stays queued after the reader gave up
        let entry = rx.try_recv().unwrap();
        assert_matches!(entry.op, JournalOp::Read { .. });
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (_dir, engine) = engine().await;
        engine.create(&path("shop"), "").unwrap();
        engine.shutdown().await.unwrap();

        assert_matches!(engine.create(&path("mall"), ""), Err(Error::Internal(_)));
        assert!(engine.resolver().resolve(&path("shop")).exists());
    }
}
