//! Consumer side: turn an ordered batch stream into a mirror tree.

use crate::action::{Action, HeapListener, InitialUpdate, Update};
use crate::error::{Result, Violation};
use crate::node::NodeTable;
use crate::subscription::Delivery;

/// Default listener: an id-indexed copy of the heap.
///
/// Uses the same arena as [`HeapModel`](crate::HeapModel), so a mirror fed
/// every batch compares equal to the writer's table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mirror {
    table: NodeTable,
    terminated: bool,
}

impl Mirror {
    /// Empty mirror.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrored tree.
    #[must_use]
    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// Whether `TerminateHeap` has been applied.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl HeapListener for Mirror {
    fn apply_update(&mut self, actions: &[Action]) -> Result<()> {
        if self.terminated {
            return Err(Violation::ActionAfterTermination.into());
        }
        if let Some(position) = actions.iter().position(Action::is_terminate) {
            if position + 1 != actions.len() {
                return Err(Violation::ActionAfterTermination.into());
            }
        }
        self.table.apply_batch(actions)?;
        if actions.last().is_some_and(Action::is_terminate) {
            self.terminated = true;
        }
        Ok(())
    }
}

/// Replay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// Waiting for the initial update
    Uninitialized,
    /// Applying updates
    Active,
    /// `TerminateHeap` seen; nothing more is accepted
    Terminated,
}

/// State machine feeding a [`HeapListener`] from a subscription stream.
#[derive(Debug)]
pub struct ReplayEngine<L: HeapListener = Mirror> {
    listener: L,
    state: ReplayState,
    applied: u64,
}

impl ReplayEngine<Mirror> {
    /// Engine replaying into a fresh [`Mirror`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_listener(Mirror::new())
    }

    /// The mirrored tree.
    #[must_use]
    pub fn mirror(&self) -> &Mirror {
        &self.listener
    }
}

impl Default for ReplayEngine<Mirror> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: HeapListener> ReplayEngine<L> {
    /// Engine replaying into `listener`.
    #[must_use]
    pub fn with_listener(listener: L) -> Self {
        Self {
            listener,
            state: ReplayState::Uninitialized,
            applied: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Number of batches applied, baseline included.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// The listener.
    #[must_use]
    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Consume the engine and return the listener.
    #[must_use]
    pub fn into_listener(self) -> L {
        self.listener
    }

    /// Apply the baseline.
    ///
    /// # Errors
    ///
    /// Fails if a baseline was already applied, the heap terminated, or the
    /// listener rejects the batch.
    pub fn apply_initial(&mut self, initial: &InitialUpdate) -> Result<()> {
        match self.state {
            ReplayState::Uninitialized => {}
            ReplayState::Active => return Err(Violation::AlreadyInitialized.into()),
            ReplayState::Terminated => return Err(Violation::HeapTerminated.into()),
        }
        self.apply(initial.as_update())
    }

    /// Apply a batch that follows the baseline.
    ///
    /// # Errors
    ///
    /// Fails before the baseline, after termination, or if the listener
    /// rejects the batch.
    pub fn apply_update(&mut self, update: &Update) -> Result<()> {
        match self.state {
            ReplayState::Uninitialized => return Err(Violation::NotInitialized.into()),
            ReplayState::Active => {}
            ReplayState::Terminated => return Err(Violation::HeapTerminated.into()),
        }
        self.apply(update)
    }

    /// Apply one item from a subscription.
    ///
    /// # Errors
    ///
    /// Same as [`apply_initial`](Self::apply_initial) and
    /// [`apply_update`](Self::apply_update).
    pub fn receive(&mut self, delivery: &Delivery) -> Result<()> {
        match delivery {
            Delivery::Initial(initial) => self.apply_initial(initial),
            Delivery::Update(update) => self.apply_update(update),
        }
    }

    fn apply(&mut self, update: &Update) -> Result<()> {
        update.apply(&mut self.listener)?;
        self.applied += 1;
        self.state = if update.terminates() {
            ReplayState::Terminated
        } else {
            ReplayState::Active
        };
        tracing::trace!(actions = update.len(), state = ?self.state, "Replayed update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeapError;
    use crate::node::{NodeId, NodeKind};

    fn baseline() -> InitialUpdate {
        InitialUpdate::new(vec![
            Action::install_root(NodeId(0), NodeKind::Map),
            Action::install_field(NodeId(0), NodeId(1), "child", NodeKind::Map),
        ])
        .unwrap()
    }

    fn update(actions: Vec<Action>) -> Update {
        Update::new(actions).unwrap()
    }

    #[test]
    fn update_before_baseline_is_rejected() {
        let mut engine = ReplayEngine::new();
        let err = engine
            .apply_update(&update(vec![Action::install_root(NodeId(0), NodeKind::Map)]))
            .unwrap_err();
        assert_eq!(err, HeapError::from(Violation::NotInitialized));
        assert_eq!(engine.state(), ReplayState::Uninitialized);
    }

    #[test]
    fn second_baseline_is_rejected() {
        let mut engine = ReplayEngine::new();
        engine.apply_initial(&baseline()).unwrap();
        assert_eq!(engine.state(), ReplayState::Active);

        let err = engine.apply_initial(&baseline()).unwrap_err();
        assert_eq!(err.violation(), Some(&Violation::AlreadyInitialized));
    }

    #[test]
    fn failed_batch_is_rolled_back() {
        let mut engine = ReplayEngine::new();
        engine.apply_initial(&baseline()).unwrap();
        let before = engine.mirror().clone();

        let err = engine
            .apply_update(&update(vec![
                Action::install_field(NodeId(1), NodeId(5), "x", NodeKind::Scalar),
                Action::install_field(NodeId(99), NodeId(6), "y", NodeKind::Scalar),
            ]))
            .unwrap_err();

        assert_eq!(err.violation(), Some(&Violation::DanglingParent(NodeId(99))));
        assert!(engine.mirror().table().get(NodeId(5)).is_none());
        assert!(engine.mirror().table().get(NodeId(6)).is_none());
        assert_eq!(engine.mirror(), &before);
        assert_eq!(engine.applied(), 1);
    }

    #[test]
    fn deallocated_ids_stay_invalid() {
        let mut engine = ReplayEngine::new();
        engine.apply_initial(&baseline()).unwrap();
        engine
            .apply_update(&update(vec![
                Action::install_field(NodeId(1), NodeId(2), "leaf", NodeKind::Scalar).with_value("v"),
                Action::remove_field(NodeId(0), NodeId(1), "child"),
            ]))
            .unwrap();

        let table = engine.mirror().table();
        assert!(table.is_retired(NodeId(1)));
        assert!(table.is_retired(NodeId(2)));

        let err = engine
            .apply_update(&update(vec![Action::install_field(
                NodeId(2),
                NodeId(3),
                "z",
                NodeKind::Scalar,
            )]))
            .unwrap_err();
        assert_eq!(err.violation(), Some(&Violation::Deallocated(NodeId(2))));
    }

    #[test]
    fn terminate_freezes_mirror() {
        let mut engine = ReplayEngine::new();
        engine.apply_initial(&baseline()).unwrap();

        let err = engine
            .apply_update(&update(vec![
                Action::TerminateHeap,
                Action::remove_children(NodeId(0)),
            ]))
            .unwrap_err();
        assert_eq!(err.violation(), Some(&Violation::ActionAfterTermination));
        assert_eq!(engine.state(), ReplayState::Active);

        engine.apply_update(&update(vec![Action::TerminateHeap])).unwrap();
        assert_eq!(engine.state(), ReplayState::Terminated);
        assert!(engine.mirror().is_terminated());

        let err = engine
            .apply_update(&update(vec![Action::remove_children(NodeId(0))]))
            .unwrap_err();
        assert_eq!(err.violation(), Some(&Violation::HeapTerminated));
    }

    #[test]
    fn receive_dispatches_on_delivery_kind() {
        use std::sync::Arc;

        let mut engine = ReplayEngine::new();
        engine.receive(&Delivery::Initial(Arc::new(baseline()))).unwrap();
        engine
            .receive(&Delivery::Update(Arc::new(update(vec![Action::remove_children(NodeId(0))]))))
            .unwrap();
        assert!(engine.mirror().table().get(NodeId(0)).unwrap().is_leaf());
    }
}
