//! The authoritative heap: tree, id allocator and open batch.

use crate::action::{Action, InitialUpdate, Update};
use crate::error::{Result, Violation};
use crate::log::LoggedHistory;
use crate::node::{NodeId, NodeKind, NodeTable};

/// Single-writer owner of a heap's tree.
///
/// Mutations happen between [`begin_update`](Self::begin_update) and
/// [`end_update`](Self::end_update). Every primitive validates, mutates the
/// arena and records the matching action; `end_update` returns the batch.
/// Ids come from a per-heap counter and are never handed out twice.
#[derive(Debug)]
pub struct HeapModel {
    heap_id: String,
    table: NodeTable,
    next_id: u64,
    pending: Option<Vec<Action>>,
    terminated: bool,
}

impl HeapModel {
    /// Create an empty heap.
    #[must_use]
    pub fn new(heap_id: impl Into<String>) -> Self {
        Self {
            heap_id: heap_id.into(),
            table: NodeTable::new(),
            next_id: 0,
            pending: None,
            terminated: false,
        }
    }

    /// Rebuild a heap from a logged baseline and update tail.
    ///
    /// # Errors
    ///
    /// Returns a contract violation if the history does not replay.
    pub fn recover(heap_id: impl Into<String>, history: LoggedHistory) -> Result<Self> {
        let mut model = Self::new(heap_id);
        if let Some(baseline) = &history.baseline {
            model.table.apply_batch(baseline.initial.actions())?;
            model.next_id = baseline.next_id;
        }
        for update in &history.updates {
            if model.terminated {
                return Err(Violation::ActionAfterTermination.into());
            }
            model.table.apply_batch(update.actions())?;
            model.terminated = update.terminates();
        }
        if let Some(high_water) = model.table.high_water() {
            model.next_id = model.next_id.max(u64::from(high_water.0) + 1);
        }
        if let Some(last_issued) = model.next_id.checked_sub(1) {
            if let Ok(last_issued) = u32::try_from(last_issued) {
                model.table.retire_through(NodeId(last_issued));
            }
        }

        tracing::info!(
            heap_id = %model.heap_id,
            nodes = model.table.len(),
            updates = history.updates.len(),
            next_id = model.next_id,
            terminated = model.terminated,
            "Recovered heap"
        );
        Ok(model)
    }

    /// Heap identifier.
    #[must_use]
    pub fn heap_id(&self) -> &str {
        &self.heap_id
    }

    /// Current tree.
    #[must_use]
    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// Next id the allocator will hand out.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Whether `terminate` has been recorded.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether a batch is open.
    #[must_use]
    pub fn in_update(&self) -> bool {
        self.pending.is_some()
    }

    /// Open a batch.
    ///
    /// # Errors
    ///
    /// Fails if the heap is terminated or a batch is already open.
    pub fn begin_update(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Violation::HeapTerminated.into());
        }
        if self.pending.is_some() {
            return Err(Violation::UpdateInProgress.into());
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    /// Close the batch and return it, or `None` if nothing was recorded.
    ///
    /// # Errors
    ///
    /// Fails if no batch is open.
    pub fn end_update(&mut self) -> Result<Option<Update>> {
        let actions = self.pending.take().ok_or(Violation::NoUpdateInProgress)?;
        if actions.is_empty() {
            return Ok(None);
        }
        let update = Update::new(actions)?;
        tracing::debug!(
            heap_id = %self.heap_id,
            actions = update.len(),
            terminated = self.terminated,
            "Closed update"
        );
        Ok(Some(update))
    }

    /// Synthesize the initial update for a joining subscriber.
    ///
    /// Must be taken between batches; returns `None` before a root exists.
    #[must_use]
    pub fn snapshot(&self) -> Option<InitialUpdate> {
        InitialUpdate::new(self.table.snapshot_actions()).ok()
    }

    /// Install the root, or return it if one of this kind already exists.
    ///
    /// # Errors
    ///
    /// Fails outside a batch, after termination, or if the root has a
    /// different kind.
    pub fn ensure_root(&mut self, kind: NodeKind) -> Result<NodeId> {
        self.check_writable()?;
        if let Some(root) = self.table.root() {
            return match self.table.get(root) {
                Some(node) if node.kind() == kind => Ok(root),
                _ => Err(Violation::RootAlreadyInstalled.into()),
            };
        }
        let id = self.peek_id()?;
        self.record(Action::install_root(id, kind))?;
        self.advance();
        Ok(id)
    }

    /// Ensure `parent` has a field `name` of `kind`.
    ///
    /// An existing field of the same kind is returned as is. One of another
    /// kind is removed and replaced by a new node.
    ///
    /// # Errors
    ///
    /// Fails outside a batch, after termination, or if `parent` is not a
    /// live map.
    pub fn ensure_field(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        self.check_writable()?;
        let existing = self.table.container(parent, NodeKind::Map)?.field(name);
        if let Some(existing) = existing {
            if self.table.get(existing).is_some_and(|node| node.kind() == kind) {
                return Ok(existing);
            }
            self.remove_field(parent, name)?;
        }
        self.install_field(parent, name, kind, None)
    }

    /// Set field `name` of `parent` to a scalar holding `value`.
    ///
    /// Scalars are immutable per id, so a different existing value is
    /// removed and reinstalled under a fresh id.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_field`](Self::ensure_field).
    pub fn set_field(
        &mut self,
        parent: NodeId,
        name: &str,
        value: impl Into<String>,
    ) -> Result<NodeId> {
        let value = value.into();
        self.check_writable()?;
        let existing = self.table.container(parent, NodeKind::Map)?.field(name);
        if let Some(existing) = existing {
            let unchanged = self.table.get(existing).is_some_and(|node| {
                node.kind() == NodeKind::Scalar && node.value() == Some(value.as_str())
            });
            if unchanged {
                return Ok(existing);
            }
            self.remove_field(parent, name)?;
        }
        self.install_field(parent, name, NodeKind::Scalar, Some(value))
    }

    /// Ensure `parent` has a child of `kind` at `index`.
    ///
    /// Lists are sparse and positions are never re-indexed; an occupied
    /// position holding another kind is an error.
    ///
    /// # Errors
    ///
    /// Fails outside a batch, after termination, if `parent` is not a live
    /// list, or if `index` holds a node of another kind.
    pub fn ensure_index(&mut self, parent: NodeId, index: u32, kind: NodeKind) -> Result<NodeId> {
        self.check_writable()?;
        let existing = self.table.container(parent, NodeKind::List)?.index(index);
        if let Some(existing) = existing {
            if self.table.get(existing).is_some_and(|node| node.kind() == kind) {
                return Ok(existing);
            }
            return Err(Violation::OccupiedIndex { parent, index }.into());
        }
        self.install_index(parent, index, kind, None)
    }

    /// Place a scalar holding `value` at `index` of `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_index`](Self::ensure_index); an occupied position
    /// with a different value is also an error.
    pub fn set_index(
        &mut self,
        parent: NodeId,
        index: u32,
        value: impl Into<String>,
    ) -> Result<NodeId> {
        let value = value.into();
        self.check_writable()?;
        let existing = self.table.container(parent, NodeKind::List)?.index(index);
        if let Some(existing) = existing {
            let unchanged = self.table.get(existing).is_some_and(|node| {
                node.kind() == NodeKind::Scalar && node.value() == Some(value.as_str())
            });
            if unchanged {
                return Ok(existing);
            }
            return Err(Violation::OccupiedIndex { parent, index }.into());
        }
        self.install_index(parent, index, NodeKind::Scalar, Some(value))
    }

    /// Remove field `name` of `parent` and deallocate its subtree.
    ///
    /// # Errors
    ///
    /// Fails outside a batch, after termination, or if the field is absent.
    pub fn remove_field(&mut self, parent: NodeId, name: &str) -> Result<Vec<NodeId>> {
        self.check_writable()?;
        let id = self
            .table
            .container(parent, NodeKind::Map)?
            .field(name)
            .ok_or_else(|| Violation::MissingField {
                parent,
                name: name.to_string(),
            })?;
        self.record(Action::remove_field(parent, id, name))
    }

    /// Remove every child of `id` and deallocate their subtrees.
    ///
    /// Records nothing if `id` has no children.
    ///
    /// # Errors
    ///
    /// Fails outside a batch, after termination, or if `id` is not live.
    pub fn remove_children(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        self.check_writable()?;
        if self.table.live(id)?.is_leaf() {
            return Ok(Vec::new());
        }
        self.record(Action::remove_children(id))
    }

    /// Record `TerminateHeap`. No mutation is legal afterwards; the open
    /// batch can still be closed.
    ///
    /// # Errors
    ///
    /// Fails outside a batch or if already terminated.
    pub fn terminate(&mut self) -> Result<()> {
        self.check_writable()?;
        self.record(Action::TerminateHeap)?;
        self.terminated = true;
        tracing::info!(heap_id = %self.heap_id, "Heap terminated");
        Ok(())
    }

    fn install_field(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        value: Option<String>,
    ) -> Result<NodeId> {
        let id = self.peek_id()?;
        self.record(Action::InstallField {
            parent,
            id,
            name: name.to_string(),
            kind,
            value,
        })?;
        self.advance();
        Ok(id)
    }

    fn install_index(
        &mut self,
        parent: NodeId,
        index: u32,
        kind: NodeKind,
        value: Option<String>,
    ) -> Result<NodeId> {
        let id = self.peek_id()?;
        self.record(Action::InstallIndex {
            parent,
            id,
            index,
            kind,
            value,
        })?;
        self.advance();
        Ok(id)
    }

    fn check_writable(&self) -> Result<()> {
        if self.terminated {
            return Err(Violation::HeapTerminated.into());
        }
        if self.pending.is_none() {
            return Err(Violation::NoUpdateInProgress.into());
        }
        Ok(())
    }

    fn peek_id(&self) -> Result<NodeId> {
        u32::try_from(self.next_id)
            .map(NodeId)
            .map_err(|_| Violation::IdSpaceExhausted.into())
    }

    fn advance(&mut self) {
        self.next_id += 1;
    }

    fn record(&mut self, mut action: Action) -> Result<Vec<NodeId>> {
        self.check_writable()?;
        let deallocated = self.table.apply(&action)?;
        action.record_deallocated(deallocated.clone());
        tracing::trace!(heap_id = %self.heap_id, action = ?action.tag(), "Recorded action");
        if let Some(pending) = self.pending.as_mut() {
            pending.push(action);
        }
        Ok(deallocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeapError;
    use crate::log::Baseline;

    fn open(model: &mut HeapModel) {
        model.begin_update().unwrap();
    }

    #[test]
    fn first_update_allocates_from_zero() {
        let mut model = HeapModel::new("greeting");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        let message = model.ensure_field(root, "message", NodeKind::Scalar).unwrap();
        let update = model.end_update().unwrap().unwrap();

        assert_eq!(root, NodeId(0));
        assert_eq!(message, NodeId(1));
        assert_eq!(
            update.actions(),
            &[
                Action::install_root(NodeId(0), NodeKind::Map),
                Action::install_field(NodeId(0), NodeId(1), "message", NodeKind::Scalar),
            ]
        );
    }

    #[test]
    fn snapshot_after_update() {
        let mut model = HeapModel::new("greeting");
        open(&mut model);
        model.ensure_root(NodeKind::Map).unwrap();
        model.end_update().unwrap();

        open(&mut model);
        model.ensure_field(NodeId(0), "message", NodeKind::Scalar).unwrap();
        model.end_update().unwrap();

        let snapshot = model.snapshot().unwrap();
        assert_eq!(
            snapshot.actions(),
            &[
                Action::install_root(NodeId(0), NodeKind::Map),
                Action::install_field(NodeId(0), NodeId(1), "message", NodeKind::Scalar),
            ]
        );
    }

    #[test]
    fn mutation_outside_update_is_rejected() {
        let mut model = HeapModel::new("h");
        let err = model.ensure_root(NodeKind::Map).unwrap_err();
        assert_eq!(err, HeapError::from(Violation::NoUpdateInProgress));

        assert_eq!(
            model.end_update().unwrap_err(),
            HeapError::from(Violation::NoUpdateInProgress)
        );

        open(&mut model);
        assert_eq!(
            model.begin_update().unwrap_err(),
            HeapError::from(Violation::UpdateInProgress)
        );
    }

    #[test]
    fn mutation_after_terminate_is_rejected() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        model.terminate().unwrap();

        let err = model.ensure_field(root, "late", NodeKind::Scalar).unwrap_err();
        assert_eq!(err.violation(), Some(&Violation::HeapTerminated));

        let update = model.end_update().unwrap().unwrap();
        assert!(update.terminates());
        assert_eq!(
            model.begin_update().unwrap_err(),
            HeapError::from(Violation::HeapTerminated)
        );
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        let list = model.ensure_field(root, "items", NodeKind::List).unwrap();
        model.end_update().unwrap();

        open(&mut model);
        assert_eq!(model.ensure_root(NodeKind::Map).unwrap(), root);
        assert_eq!(model.ensure_field(root, "items", NodeKind::List).unwrap(), list);
        assert!(model.end_update().unwrap().is_none());
    }

    #[test]
    fn kind_change_reinstalls_field() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        let old = model.ensure_field(root, "slot", NodeKind::Scalar).unwrap();
        let new = model.ensure_field(root, "slot", NodeKind::List).unwrap();
        let update = model.end_update().unwrap().unwrap();

        assert_ne!(old, new);
        assert!(model.table().is_retired(old));
        assert_eq!(update.actions()[2], Action::remove_field(root, old, "slot"));
        assert_eq!(update.actions()[2].deallocated(), &[old]);
    }

    #[test]
    fn set_field_replaces_value_under_new_id() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        let first = model.set_field(root, "status", "starting").unwrap();
        let same = model.set_field(root, "status", "starting").unwrap();
        let second = model.set_field(root, "status", "running").unwrap();
        model.end_update().unwrap();

        assert_eq!(first, same);
        assert_ne!(first, second);
        let node = model.table().get(second).unwrap();
        assert_eq!(node.value(), Some("running"));
        assert!(model.table().get(first).is_none());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        let a = model.ensure_field(root, "a", NodeKind::Map).unwrap();
        model.ensure_field(a, "b", NodeKind::Scalar).unwrap();
        let gone = model.remove_field(root, "a").unwrap();
        let again = model.ensure_field(root, "a", NodeKind::Map).unwrap();
        model.end_update().unwrap();

        assert_eq!(gone.len(), 2);
        assert!(!gone.contains(&again));
        assert_eq!(again, NodeId(3));
    }

    #[test]
    fn list_positions_are_sparse() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::List).unwrap();
        model.set_index(root, 0, "zero").unwrap();
        model.set_index(root, 5, "five").unwrap();

        let err = model.set_index(root, 0, "other").unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::OccupiedIndex {
                parent: root,
                index: 0
            })
        );
        let err = model.ensure_index(root, 5, NodeKind::Map).unwrap_err();
        assert!(matches!(err.violation(), Some(Violation::OccupiedIndex { .. })));

        assert_eq!(model.remove_children(root).unwrap().len(), 2);
        assert!(model.remove_children(root).unwrap().is_empty());
        let update = model.end_update().unwrap().unwrap();
        assert_eq!(update.len(), 4);
    }

    #[test]
    fn failed_primitive_records_nothing() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        let err = model.ensure_field(NodeId(42), "x", NodeKind::Scalar).unwrap_err();
        assert_eq!(err.violation(), Some(&Violation::DanglingParent(NodeId(42))));
        assert!(model.remove_field(root, "missing").is_err());

        let update = model.end_update().unwrap().unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(model.next_id(), 1);
    }

    #[test]
    fn recover_restores_allocator() {
        let mut model = HeapModel::new("h");
        let mut history = LoggedHistory::default();

        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        model.ensure_field(root, "a", NodeKind::Scalar).unwrap();
        model.ensure_field(root, "b", NodeKind::Scalar).unwrap();
        model.remove_field(root, "b").unwrap();
        history.updates.push(model.end_update().unwrap().unwrap());

        let recovered = HeapModel::recover("h", history).unwrap();
        assert_eq!(recovered.table(), model.table());
        assert_eq!(recovered.next_id(), 3);
        assert!(recovered.table().is_retired(NodeId(2)));
    }

    #[test]
    fn ids_removed_after_baseline_stay_retired() {
        let mut model = HeapModel::new("h");
        open(&mut model);
        let root = model.ensure_root(NodeKind::Map).unwrap();
        for n in 0..1000 {
            model.set_field(root, "counter", n.to_string()).unwrap();
        }
        model.ensure_field(root, "tail", NodeKind::Scalar).unwrap();
        model.remove_field(root, "tail").unwrap();
        model.end_update().unwrap();

        // Baseline holds ids 0 and 1000; 1001 was issued and removed after it
        let history = LoggedHistory {
            baseline: Some(Baseline {
                initial: model.snapshot().unwrap(),
                next_id: model.next_id(),
            }),
            updates: Vec::new(),
        };
        let recovered = HeapModel::recover("h", history).unwrap();

        assert_eq!(recovered.table().len(), 2);
        assert_eq!(recovered.next_id(), 1002);
        for id in [1, 500, 999, 1001] {
            assert!(recovered.table().is_retired(NodeId(id)));
        }
        assert!(!recovered.table().is_retired(NodeId(1000)));
        assert!(!recovered.table().is_retired(NodeId(1002)));
        assert_eq!(
            recovered.table().live(NodeId(1001)).unwrap_err().violation(),
            Some(&Violation::Deallocated(NodeId(1001)))
        );
    }
}
