//! Property tests: random mutation scripts against a heap and its mirrors.

use heapsync_core::{
    Action, HeapModel, HeapOptions, InitialUpdate, NodeId, NodeKind, ReplayEngine, SharedHeap,
    Update, Violation,
};
use proptest::prelude::*;

/// One writer operation, addressed by position into the live id list so
/// that most generated steps hit real nodes.
#[derive(Debug, Clone)]
enum Step {
    Field { parent: usize, name: u8, kind: u8 },
    Value { parent: usize, name: u8, value: u8 },
    Index { parent: usize, index: u8, kind: u8 },
    Remove { parent: usize, name: u8 },
    Clear { target: usize },
    Commit,
}

fn kind(code: u8) -> NodeKind {
    match code % 3 {
        0 => NodeKind::Map,
        1 => NodeKind::List,
        _ => NodeKind::Scalar,
    }
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (any::<usize>(), 0u8..4, any::<u8>())
            .prop_map(|(parent, name, kind)| Step::Field { parent, name, kind }),
        (any::<usize>(), 0u8..4, 0u8..3)
            .prop_map(|(parent, name, value)| Step::Value { parent, name, value }),
        (any::<usize>(), 0u8..4, any::<u8>())
            .prop_map(|(parent, index, kind)| Step::Index { parent, index, kind }),
        (any::<usize>(), 0u8..4).prop_map(|(parent, name)| Step::Remove { parent, name }),
        any::<usize>().prop_map(|target| Step::Clear { target }),
        Just(Step::Commit),
    ]
}

fn pick(model: &HeapModel, position: usize) -> NodeId {
    let mut ids: Vec<NodeId> = model.table().ids().collect();
    ids.sort();
    if ids.is_empty() {
        NodeId(0)
    } else {
        ids[position % ids.len()]
    }
}

/// Run a script; contract violations from mistargeted steps are expected and
/// must leave no trace in the batch. `on_commit` sees the model and the
/// update history after every closed batch.
fn run(
    model: &mut HeapModel,
    steps: &[Step],
    mut on_commit: impl FnMut(&HeapModel, &[Update]),
) -> Vec<Update> {
    let mut updates = Vec::new();
    model.begin_update().unwrap();
    model.ensure_root(NodeKind::Map).unwrap();
    for step in steps {
        let _ = match *step {
            Step::Field { parent, name, kind: code } => {
                let parent = pick(model, parent);
                model.ensure_field(parent, &format!("f{name}"), kind(code)).map(drop)
            }
            Step::Value { parent, name, value } => {
                let parent = pick(model, parent);
                model.set_field(parent, &format!("f{name}"), format!("v{value}")).map(drop)
            }
            Step::Index { parent, index, kind: code } => {
                let parent = pick(model, parent);
                model.ensure_index(parent, u32::from(index), kind(code)).map(drop)
            }
            Step::Remove { parent, name } => {
                let parent = pick(model, parent);
                model.remove_field(parent, &format!("f{name}")).map(drop)
            }
            Step::Clear { target } => {
                let target = pick(model, target);
                model.remove_children(target).map(drop)
            }
            Step::Commit => {
                updates.extend(model.end_update().unwrap());
                on_commit(model, &updates);
                model.begin_update().unwrap();
                Ok(())
            }
        };
    }
    updates.extend(model.end_update().unwrap());
    on_commit(model, &updates);
    updates
}

fn replay_history(updates: &[Update]) -> ReplayEngine {
    let mut engine = ReplayEngine::new();
    if let Some((first, rest)) = updates.split_first() {
        engine
            .apply_initial(&InitialUpdate::from_update(first.clone()))
            .unwrap();
        for update in rest {
            engine.apply_update(update).unwrap();
        }
    }
    engine
}

proptest! {
    #[test]
    fn replay_is_deterministic(steps in prop::collection::vec(step(), 0..64)) {
        let mut model = HeapModel::new("prop");
        let updates = run(&mut model, &steps, |_, _| {});
        prop_assume!(!updates.is_empty());

        let engine = replay_history(&updates);
        prop_assert_eq!(engine.mirror().table(), model.table());
    }

    #[test]
    fn snapshot_matches_history(steps in prop::collection::vec(step(), 0..64)) {
        let mut model = HeapModel::new("prop");
        let mut checkpoints = Vec::new();
        let updates = run(&mut model, &steps, |model, updates| {
            checkpoints.push((model.snapshot(), updates.len()));
        });
        for (snapshot, prefix) in checkpoints {
            let snapshot = snapshot.unwrap();
            let mut from_snapshot = ReplayEngine::new();
            from_snapshot.apply_initial(&snapshot).unwrap();

            let from_history = replay_history(&updates[..prefix]);
            prop_assert_eq!(from_snapshot.mirror().table(), from_history.mirror().table());
        }
    }

    #[test]
    fn deallocated_ids_are_never_reused(steps in prop::collection::vec(step(), 0..64)) {
        let mut model = HeapModel::new("prop");
        let updates = run(&mut model, &steps, |_, _| {});

        let mut installed = std::collections::HashSet::new();
        let mut retired = std::collections::HashSet::new();
        for action in updates.iter().flat_map(Update::actions) {
            match action {
                Action::InstallRoot { id, .. }
                | Action::InstallField { id, .. }
                | Action::InstallIndex { id, .. } => {
                    prop_assert!(installed.insert(*id), "id {} installed twice", id);
                }
                Action::RemoveField { .. } | Action::RemoveChildren { .. } => {
                    retired.extend(action.deallocated().iter().copied());
                }
                Action::TerminateHeap => {}
            }
        }
        for id in retired {
            prop_assert!(model.table().is_retired(id));
            let err = model.table().live(id).unwrap_err();
            prop_assert_eq!(err.violation(), Some(&Violation::Deallocated(id)));
        }
    }
}

#[test]
fn late_subscriber_sees_same_tree_as_early_one() {
    let heap = SharedHeap::new("joiners", HeapOptions::default());
    let mut early = heap.subscribe().unwrap();

    {
        let mut tx = heap.begin_update().unwrap();
        let root = tx.ensure_root(NodeKind::Map).unwrap();
        let list = tx.ensure_field(root, "items", NodeKind::List).unwrap();
        tx.set_index(list, 0, "first").unwrap();
        tx.set_index(list, 3, "fourth").unwrap();
    }
    let mut late = heap.subscribe().unwrap();
    {
        let mut tx = heap.begin_update().unwrap();
        tx.set_field(NodeId(0), "title", "list").unwrap();
        tx.remove_children(NodeId(1)).unwrap();
    }

    let mut early_engine = ReplayEngine::new();
    let mut late_engine = ReplayEngine::new();
    while let Some(delivery) = early.try_recv().unwrap() {
        early_engine.receive(&delivery).unwrap();
    }
    while let Some(delivery) = late.try_recv().unwrap() {
        late_engine.receive(&delivery).unwrap();
    }

    assert_eq!(early_engine.applied(), 2);
    assert_eq!(late_engine.applied(), 2);
    assert_eq!(early_engine.mirror().table(), late_engine.mirror().table());
    heap.read(|table| assert_eq!(table, early_engine.mirror().table()));
}
