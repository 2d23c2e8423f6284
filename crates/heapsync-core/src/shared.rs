//! Thread-safe heap handle.
//!
//! [`SharedHeap`] puts a [`HeapModel`], its [`SubscriptionManager`] and an
//! optional [`ActionLog`] behind one mutex. A [`Transaction`] holds that lock
//! from `begin_update` to commit, so snapshots for new subscribers are always
//! taken between batches.

use crate::action::{InitialUpdate, Update};
use crate::error::Result;
use crate::heap::HeapModel;
use crate::log::{ActionLog, Baseline};
use crate::node::{NodeId, NodeKind, NodeTable};
use crate::subscription::{SubscriberId, Subscription, SubscriptionManager};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Default per-subscriber queue length.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Tuning for a [`SharedHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOptions {
    /// Per-subscriber queue length
    pub queue_capacity: usize,
    /// Compact the log after this many appended updates
    pub compact_every: Option<usize>,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            compact_every: None,
        }
    }
}

struct Inner {
    model: HeapModel,
    subscribers: SubscriptionManager,
    log: Option<Box<dyn ActionLog>>,
    since_compaction: usize,
    options: HeapOptions,
}

impl Inner {
    /// Close the open batch and hand it on: subscribers first, then the log.
    fn flush(&mut self) -> Result<Option<Arc<Update>>> {
        let Some(update) = self.model.end_update()? else {
            return Ok(None);
        };
        let update = Arc::new(update);
        self.subscribers.publish(&update);

        if let Some(log) = self.log.as_mut() {
            log.append(&update)?;
            self.since_compaction += 1;
            let due = self
                .options
                .compact_every
                .is_some_and(|every| self.since_compaction >= every);
            if due && !self.model.is_terminated() {
                if let Some(initial) = self.model.snapshot() {
                    log.compact(&Baseline {
                        initial,
                        next_id: self.model.next_id(),
                    })?;
                    self.since_compaction = 0;
                    tracing::debug!(
                        heap_id = %self.model.heap_id(),
                        next_id = self.model.next_id(),
                        "Compacted action log"
                    );
                }
            }
        }
        Ok(Some(update))
    }
}

/// A heap shared between one writer at a time and many subscribers.
pub struct SharedHeap {
    heap_id: String,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SharedHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHeap")
            .field("heap_id", &self.heap_id)
            .finish_non_exhaustive()
    }
}

impl SharedHeap {
    /// Create an empty in-memory heap.
    #[must_use]
    pub fn new(heap_id: impl Into<String>, options: HeapOptions) -> Self {
        let heap_id = heap_id.into();
        Self::from_parts(HeapModel::new(heap_id.clone()), None, options)
    }

    /// Open a heap backed by `log`, replaying whatever it already holds.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::Log` if the log cannot be read, or a contract
    /// violation if its history does not replay.
    pub fn with_log(
        heap_id: impl Into<String>,
        mut log: Box<dyn ActionLog>,
        options: HeapOptions,
    ) -> Result<Self> {
        let history = log.load()?;
        let model = HeapModel::recover(heap_id, history)?;
        Ok(Self::from_parts(model, Some(log), options))
    }

    fn from_parts(model: HeapModel, log: Option<Box<dyn ActionLog>>, options: HeapOptions) -> Self {
        let heap_id = model.heap_id().to_string();
        let mut subscribers = SubscriptionManager::new(heap_id.clone(), options.queue_capacity);
        if model.is_terminated() {
            subscribers.mark_terminated();
        }
        Self {
            heap_id,
            inner: Mutex::new(Inner {
                model,
                subscribers,
                log,
                since_compaction: 0,
                options,
            }),
        }
    }

    /// Heap identifier.
    #[must_use]
    pub fn heap_id(&self) -> &str {
        &self.heap_id
    }

    /// Take the writer lock and open a batch.
    ///
    /// # Errors
    ///
    /// Returns `HeapTerminated` once the heap has ended.
    pub fn begin_update(&self) -> Result<Transaction<'_>> {
        let mut guard = self.inner.lock();
        guard.model.begin_update()?;
        Ok(Transaction {
            guard,
            committed: false,
        })
    }

    /// Register a subscriber. Its first delivery is the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns `HeapTerminated` once the heap has ended.
    pub fn subscribe(&self) -> Result<Subscription> {
        let mut inner = self.inner.lock();
        let baseline = inner.model.snapshot();
        inner.subscribers.subscribe(baseline)
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.lock().subscribers.unsubscribe(id)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Snapshot of the current tree.
    #[must_use]
    pub fn snapshot(&self) -> Option<InitialUpdate> {
        self.inner.lock().model.snapshot()
    }

    /// Whether the heap has ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().model.is_terminated()
    }

    /// Run `f` against the current tree.
    pub fn read<R>(&self, f: impl FnOnce(&NodeTable) -> R) -> R {
        f(self.inner.lock().model.table())
    }

    /// Terminate the heap in a batch of its own.
    ///
    /// # Errors
    ///
    /// Returns `HeapTerminated` if already ended, or a log failure.
    pub fn terminate(&self) -> Result<()> {
        let mut tx = self.begin_update()?;
        tx.terminate()?;
        tx.commit()?;
        Ok(())
    }
}

/// An open batch on a [`SharedHeap`].
///
/// Holds the heap lock. [`commit`](Self::commit) closes the batch and
/// delivers it; dropping without committing does the same and logs any
/// failure.
pub struct Transaction<'a> {
    guard: MutexGuard<'a, Inner>,
    committed: bool,
}

impl Transaction<'_> {
    /// See [`HeapModel::ensure_root`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn ensure_root(&mut self, kind: NodeKind) -> Result<NodeId> {
        self.guard.model.ensure_root(kind)
    }

    /// See [`HeapModel::ensure_field`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn ensure_field(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        self.guard.model.ensure_field(parent, name, kind)
    }

    /// See [`HeapModel::set_field`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn set_field(&mut self, parent: NodeId, name: &str, value: impl Into<String>) -> Result<NodeId> {
        self.guard.model.set_field(parent, name, value)
    }

    /// See [`HeapModel::ensure_index`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn ensure_index(&mut self, parent: NodeId, index: u32, kind: NodeKind) -> Result<NodeId> {
        self.guard.model.ensure_index(parent, index, kind)
    }

    /// See [`HeapModel::set_index`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn set_index(&mut self, parent: NodeId, index: u32, value: impl Into<String>) -> Result<NodeId> {
        self.guard.model.set_index(parent, index, value)
    }

    /// See [`HeapModel::remove_field`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn remove_field(&mut self, parent: NodeId, name: &str) -> Result<Vec<NodeId>> {
        self.guard.model.remove_field(parent, name)
    }

    /// See [`HeapModel::remove_children`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn remove_children(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        self.guard.model.remove_children(id)
    }

    /// See [`HeapModel::terminate`].
    ///
    /// # Errors
    ///
    /// Propagates the model's contract violations.
    pub fn terminate(&mut self) -> Result<()> {
        self.guard.model.terminate()
    }

    /// The tree as mutated so far.
    #[must_use]
    pub fn table(&self) -> &NodeTable {
        self.guard.model.table()
    }

    /// Close the batch, deliver it to subscribers and append it to the log.
    ///
    /// Returns `None` if nothing was recorded.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::Log` if the log write fails; subscribers have
    /// already received the update by then.
    pub fn commit(mut self) -> Result<Option<Arc<Update>>> {
        self.committed = true;
        self.guard.flush()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.guard.flush() {
            tracing::error!(
                heap_id = %self.guard.model.heap_id(),
                error = %err,
                "Failed to flush dropped transaction"
            );
        }
    }
}
