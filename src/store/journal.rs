//! Write-Behind Journal
//!
//! The journal is the single ordered queue between request handlers and the
//! applier. Entries are sequenced and sent under one lock, so channel order,
//! sequence order and submission-time order all agree.
//!
//! # Workflow
//!
//! ```text
//! ┌──────────────┐  submit   ┌──────────────────┐  recv   ┌──────────────┐
//! │ Engine facade│──────────▶│ mpsc (FIFO)      │────────▶│   Applier    │
//! │  (N tasks)   │           └──────────────────┘         │  (1 task)    │
//! │              │  pending index: latest unapplied       │              │
//! │              │◀─ mutation per path, pruned on apply ──│              │
//! │              │  read waiters: grouped per read entry, │              │
//! │              │◀─ completed once per read-populate ────│              │
//! └──────────────┘                                        └──────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

use super::path::{Level, StorePath};

// =============================================================================
// Entries
// =============================================================================

/// Kind of journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Populate the cache from disk for a waiting reader
    Read,
    /// Create a container or persist a box value
    Write,
    /// Remove a database, table or box
    Delete,
    /// Barrier completed once everything before it is applied
    Sync,
}

impl EntryKind {
    /// Every kind, for metric aggregation
    pub const ALL: [EntryKind; 4] = [
        EntryKind::Read,
        EntryKind::Write,
        EntryKind::Delete,
        EntryKind::Sync,
    ];

    /// Lowercase name used as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Read => "read",
            EntryKind::Write => "write",
            EntryKind::Delete => "delete",
            EntryKind::Sync => "sync",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation carried by a journal entry
#[derive(Debug)]
pub enum JournalOp {
    Read { path: StorePath },
    Write { path: StorePath, value: Bytes },
    Delete { path: StorePath },
    Sync { done: oneshot::Sender<()> },
}

impl JournalOp {
    /// Kind of this operation
    pub fn kind(&self) -> EntryKind {
        match self {
            JournalOp::Read { .. } => EntryKind::Read,
            JournalOp::Write { .. } => EntryKind::Write,
            JournalOp::Delete { .. } => EntryKind::Delete,
            JournalOp::Sync { .. } => EntryKind::Sync,
        }
    }

    /// Target path, if any
    pub fn path(&self) -> Option<&StorePath> {
        match self {
            JournalOp::Read { path }
            | JournalOp::Write { path, .. }
            | JournalOp::Delete { path } => Some(path),
            JournalOp::Sync { .. } => None,
        }
    }
}

/// A pending operation. Never mutated after submission.
#[derive(Debug)]
pub struct JournalEntry {
    /// Strictly increasing per journal
    pub sequence: u64,
    /// Wall-clock submission time
    pub submitted_at: DateTime<Utc>,
    /// The operation to apply
    pub op: JournalOp,
}

/// Why a read-populate could not deliver a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// The path vanished before the entry was applied
    Missing(Level),
    /// Filesystem or permission failure
    Internal(String),
}

impl From<ReadFailure> for Error {
    fn from(failure: ReadFailure) -> Self {
        match failure {
            ReadFailure::Missing(level) => Error::NotFound(level),
            ReadFailure::Internal(reason) => Error::Internal(reason),
        }
    }
}

/// Result delivered to every reader waiting on a path
pub type ReadOutcome = std::result::Result<Bytes, ReadFailure>;

// =============================================================================
// Pending Index
// =============================================================================

/// Latest unapplied mutation for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// A write is pending. `recreated` is set when it follows a pending delete
    /// of the same path, meaning the on-disk subtree is about to be wiped.
    Present { sequence: u64, recreated: bool },
    /// A delete is pending
    Absent { sequence: u64 },
}

impl PendingState {
    /// Sequence of the mutation that produced this state
    pub fn sequence(&self) -> u64 {
        match self {
            PendingState::Present { sequence, .. } | PendingState::Absent { sequence } => *sequence,
        }
    }
}

/// Index of paths with enqueued-but-unapplied mutations
#[derive(Debug, Default)]
pub struct PendingIndex {
    entries: HashMap<StorePath, PendingState>,
}

impl PendingIndex {
    /// Latest pending state for `path`
    pub fn get(&self, path: &StorePath) -> Option<PendingState> {
        self.entries.get(path).copied()
    }

    /// True if `path` has a pending mutation
    pub fn contains(&self, path: &StorePath) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of paths with pending mutations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a pending write
    pub fn record_write(&mut self, path: &StorePath, sequence: u64) {
        let recreated = match self.entries.get(path) {
            Some(PendingState::Absent { .. }) => true,
            Some(PendingState::Present { recreated, .. }) => *recreated,
            None => false,
        };
        self.entries
            .insert(path.clone(), PendingState::Present { sequence, recreated });
    }

    /// Record a pending delete; descendants are superseded by it
    pub fn record_delete(&mut self, path: &StorePath, sequence: u64) {
        self.entries.retain(|key, _| !path.is_ancestor_of(key));
        self.entries
            .insert(path.clone(), PendingState::Absent { sequence });
    }

    /// Highest pending sequence on `path` or any of its ancestors
    pub fn latest_sequence(&self, path: &StorePath) -> Option<u64> {
        path.ancestors()
            .filter_map(|p| self.get(&p))
            .map(|state| state.sequence())
            .max()
    }

    /// Every path with a pending mutation and its latest state
    pub fn iter(&self) -> impl Iterator<Item = (&StorePath, PendingState)> + '_ {
        self.entries.iter().map(|(path, state)| (path, *state))
    }

    /// Forget `path` if its latest pending mutation is `sequence`
    pub fn complete(&mut self, path: &StorePath, sequence: u64) -> bool {
        match self.entries.get(path) {
            Some(state) if state.sequence() == sequence => {
                self.entries.remove(path);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Journal
// =============================================================================

#[derive(Debug, Default)]
struct JournalState {
    next_sequence: u64,
    pending: PendingIndex,
    closed: bool,
}

/// Receiving half of the journal, owned by the applier
pub type JournalReceiver = mpsc::UnboundedReceiver<JournalEntry>;

/// Readers completed by one read-populate entry
#[derive(Debug)]
struct ReadGroup {
    sequence: u64,
    waiters: Vec<oneshot::Sender<ReadOutcome>>,
}

/// Ordered queue of pending operations shared by the facade and the applier
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalEntry>,
    state: Mutex<JournalState>,
    waiters: DashMap<StorePath, Vec<ReadGroup>>,
    metrics: Arc<EngineMetrics>,
}

impl Journal {
    /// Create a journal and the receiver for its applier
    pub fn new(metrics: Arc<EngineMetrics>) -> (Self, JournalReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let journal = Self {
            tx,
            state: Mutex::new(JournalState::default()),
            waiters: DashMap::new(),
            metrics,
        };
        (journal, rx)
    }

    /// Lock the journal for a check-then-submit sequence.
    ///
    /// Existence checks made through the guard cannot be invalidated by
    /// another submission before this guard's own submission lands.
    pub fn lock(&self) -> JournalGuard<'_> {
        JournalGuard {
            journal: self,
            state: self.state.lock(),
        }
    }

    /// Reject every later submission
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// True once [`Journal::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Called by the applier after a write or delete has been applied (or dropped)
    pub fn complete(&self, path: &StorePath, sequence: u64) {
        if self.state.lock().pending.complete(path, sequence) {
            trace!(path = %path, sequence, "Pending mutation settled");
        }
    }

    /// Deliver the outcome of read entry `sequence` to the readers that joined it
    pub fn finish_read(&self, path: &StorePath, sequence: u64, outcome: &ReadOutcome) -> usize {
        let Some(group) = self.take_group(path, sequence) else {
            return 0;
        };
        let count = group.waiters.len();
        for waiter in group.waiters {
            // a reader that timed out has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }
        count
    }

    fn take_group(&self, path: &StorePath, sequence: u64) -> Option<ReadGroup> {
        let Entry::Occupied(mut groups) = self.waiters.entry(path.clone()) else {
            return None;
        };
        let group = groups
            .get()
            .iter()
            .position(|group| group.sequence == sequence)
            .map(|index| groups.get_mut().remove(index));
        if groups.get().is_empty() {
            groups.remove();
        }
        group
    }

    /// Drop every registered reader; their receivers observe a closed channel
    pub fn abandon_readers(&self) -> usize {
        let count = self.waiting_readers();
        self.waiters.clear();
        count
    }

    /// Number of paths with readers waiting
    pub fn waiting_paths(&self) -> usize {
        self.waiters.len()
    }

    /// Number of readers waiting across every path
    pub fn waiting_readers(&self) -> usize {
        self.waiters
            .iter()
            .map(|groups| groups.value().iter().map(|g| g.waiters.len()).sum::<usize>())
            .sum()
    }

    /// Number of paths with pending mutations
    pub fn pending_paths(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Exclusive access to the journal's submission state
pub struct JournalGuard<'a> {
    journal: &'a Journal,
    state: MutexGuard<'a, JournalState>,
}

impl JournalGuard<'_> {
    /// Pending mutations, for existence checks
    pub fn pending(&self) -> &PendingIndex {
        &self.state.pending
    }

    /// Sequence and send an operation; returns its sequence number
    pub fn submit(&mut self, op: JournalOp) -> Result<u64> {
        if self.state.closed {
            return Err(Error::Internal("Journal is closed.".into()));
        }

        self.state.next_sequence += 1;
        let sequence = self.state.next_sequence;
        let kind = op.kind();

        match &op {
            JournalOp::Write { path, .. } => self.state.pending.record_write(path, sequence),
            JournalOp::Delete { path } => self.state.pending.record_delete(path, sequence),
            JournalOp::Read { .. } | JournalOp::Sync { .. } => {}
        }

        let entry = JournalEntry {
            sequence,
            submitted_at: Utc::now(),
            op,
        };

        if let Err(mpsc::error::SendError(entry)) = self.journal.tx.send(entry) {
            if let Some(path) = entry.op.path() {
                self.state.pending.complete(path, sequence);
            }
            self.state.closed = true;
            return Err(Error::Internal("Journal applier is not running.".into()));
        }

        self.journal.metrics.record_submitted(kind);
        debug!(sequence, kind = %kind, "Journal entry submitted");
        Ok(sequence)
    }

    /// Register a reader for `path`.
    ///
    /// A reader joins the newest read entry already queued for the path when
    /// no pending mutation on the path or an ancestor was submitted after it.
    /// Otherwise a new read entry is queued behind those mutations, so a read
    /// always observes every write accepted before it.
    pub fn await_read(&mut self, path: &StorePath) -> Result<oneshot::Receiver<ReadOutcome>> {
        if self.state.closed {
            return Err(Error::Internal("Journal is closed.".into()));
        }

        let floor = self.state.pending.latest_sequence(path).unwrap_or(0);
        // the group must be visible before the entry can reach the applier
        let sequence = self.state.next_sequence + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut groups = self.journal.waiters.entry(path.clone()).or_default();
            if let Some(group) = groups.last_mut().filter(|g| g.sequence > floor) {
                group.waiters.push(tx);
                trace!(path = %path, sequence = group.sequence, "Joined in-flight read");
                return Ok(rx);
            }
            groups.push(ReadGroup {
                sequence,
                waiters: vec![tx],
            });
        }

        match self.submit(JournalOp::Read { path: path.clone() }) {
            Ok(submitted) => {
                debug_assert_eq!(submitted, sequence);
                Ok(rx)
            }
            Err(e) => {
                self.journal.take_group(path, sequence);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn journal() -> (Journal, JournalReceiver) {
        Journal::new(Arc::new(EngineMetrics::new().unwrap()))
    }

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    #[test]
    fn test_submission_order_matches_sequence() {
        let (journal, mut rx) = journal();

        for value in ["a", "b", "c"] {
            journal
                .lock()
                .submit(JournalOp::Write {
                    path: path("shop/orders/order1"),
                    value: Bytes::from(value),
                })
                .unwrap();
        }

        let mut sequences = Vec::new();
        let mut values = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            sequences.push(entry.sequence);
            if let JournalOp::Write { value, .. } = entry.op {
                values.push(value);
            }
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_pending_index_settles_on_latest_only() {
        let (journal, _rx) = journal();
        let target = path("shop/orders/order1");

        let first = journal
            .lock()
            .submit(JournalOp::Write { path: target.clone(), value: Bytes::new() })
            .unwrap();
        let second = journal
            .lock()
            .submit(JournalOp::Write { path: target.clone(), value: Bytes::new() })
            .unwrap();

        journal.complete(&target, first);
        assert!(journal.lock().pending().contains(&target));
        journal.complete(&target, second);
        assert!(!journal.lock().pending().contains(&target));
    }

    #[test]
    fn test_delete_supersedes_descendants() {
        let mut index = PendingIndex::default();
        index.record_write(&path("shop/orders/order1"), 1);
        index.record_write(&path("shop/customers/c1"), 2);
        index.record_delete(&path("shop/orders"), 3);

        assert!(!index.contains(&path("shop/orders/order1")));
        assert!(index.contains(&path("shop/customers/c1")));
        assert_eq!(
            index.get(&path("shop/orders")),
            Some(PendingState::Absent { sequence: 3 })
        );

        index.record_write(&path("shop/orders"), 4);
        assert_eq!(
            index.get(&path("shop/orders")),
            Some(PendingState::Present { sequence: 4, recreated: true })
        );
        // a stale completion does not clear the newer state
        assert!(!index.complete(&path("shop/orders"), 3));
        assert!(index.complete(&path("shop/orders"), 4));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_readers_coalesce_on_one_entry() {
        let (journal, mut rx) = journal();
        let target = path("shop/orders/order1");

        let first = journal.lock().await_read(&target).unwrap();
        let second = journal.lock().await_read(&target).unwrap();
        assert_eq!(journal.waiting_paths(), 1);

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.op.kind(), EntryKind::Read);
        assert!(rx.try_recv().is_err(), "second reader must not enqueue");

        let outcome: ReadOutcome = Ok(Bytes::from("v"));
        assert_eq!(journal.finish_read(&target, entry.sequence, &outcome), 2);
        assert_eq!(first.await.unwrap().unwrap(), "v");
        assert_eq!(second.await.unwrap().unwrap(), "v");
        assert_eq!(journal.waiting_paths(), 0);
    }

    #[tokio::test]
    async fn test_reader_after_write_queues_behind_it() {
        let (journal, mut rx) = journal();
        let target = path("shop/orders/order1");

        let before = journal.lock().await_read(&target).unwrap();
        journal
            .lock()
            .submit(JournalOp::Write { path: target.clone(), value: Bytes::from("b") })
            .unwrap();
        let after = journal.lock().await_read(&target).unwrap();
        let also_after = journal.lock().await_read(&target).unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|entry| (entry.sequence, entry.op.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![(1, EntryKind::Read), (2, EntryKind::Write), (3, EntryKind::Read)]
        );
        assert_eq!(journal.waiting_readers(), 3);

        assert_eq!(journal.finish_read(&target, 1, &Ok(Bytes::from("a"))), 1);
        assert_eq!(before.await.unwrap().unwrap(), "a");
        assert_eq!(journal.waiting_paths(), 1);

        journal.complete(&target, 2);
        assert_eq!(journal.finish_read(&target, 3, &Ok(Bytes::from("b"))), 2);
        assert_eq!(after.await.unwrap().unwrap(), "b");
        assert_eq!(also_after.await.unwrap().unwrap(), "b");
        assert_eq!(journal.waiting_paths(), 0);
    }

    #[test]
    fn test_latest_sequence_covers_ancestors() {
        let mut index = PendingIndex::default();
        index.record_write(&path("shop/orders/order1"), 2);
        index.record_delete(&path("shop"), 5);
        index.record_write(&path("mall"), 7);

        assert_eq!(index.latest_sequence(&path("shop/orders/order1")), Some(5));
        assert_eq!(index.latest_sequence(&path("mall/floors")), Some(7));
        assert_eq!(index.latest_sequence(&path("zoo/cages/c1")), None);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_reader() {
        let (journal, _rx) = journal();
        let target = path("shop/orders/order1");

        let reader = journal.lock().await_read(&target).unwrap();
        journal.finish_read(&target, 1, &Err(ReadFailure::Missing(Level::Table)));

        let err: Error = reader.await.unwrap().unwrap_err().into();
        assert_matches!(err, Error::NotFound(Level::Table));
    }

    #[tokio::test]
    async fn test_closed_journal_rejects_submissions() {
        let (journal, _rx) = journal();
        journal.close();
        assert!(journal.is_closed());

        let result = journal.lock().submit(JournalOp::Delete { path: path("shop") });
        assert_matches!(result, Err(Error::Internal(_)));
        assert_matches!(
            journal.lock().await_read(&path("shop/orders/order1")),
            Err(Error::Internal(_))
        );
    }

    #[test]
    fn test_dropped_receiver_closes_journal() {
        let (journal, rx) = journal();
        drop(rx);

        let result = journal.lock().submit(JournalOp::Write {
            path: path("shop"),
            value: Bytes::new(),
        });
        assert_matches!(result, Err(Error::Internal(_)));
        assert!(journal.lock().pending().is_empty());
        assert!(journal.is_closed());
    }
}
