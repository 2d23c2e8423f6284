//! Id-indexed node arena.
//!
//! The same table backs the authoritative [`HeapModel`](crate::HeapModel) and
//! every subscriber [`Mirror`](crate::Mirror), so both sides apply actions
//! with identical rules. Nodes never point at each other; a parent records
//! its children as `slot -> id` entries and removal walks those entries.
//!
//! Ids are installed in strictly increasing order, so any id at or below the
//! high-water mark that is not live has been deallocated. No per-id record
//! of removals is kept.

use crate::action::Action;
use crate::error::{Result, Violation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Heap-scoped node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    /// Named fields
    Map,
    /// Positional children
    List,
    /// Opaque value, no children
    Scalar,
}

impl NodeKind {
    /// Wire code for this kind.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            NodeKind::Map => 0,
            NodeKind::List => 1,
            NodeKind::Scalar => 2,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(NodeKind::Map),
            1 => Some(NodeKind::List),
            2 => Some(NodeKind::Scalar),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Map => write!(f, "MAP"),
            NodeKind::List => write!(f, "LIST"),
            NodeKind::Scalar => write!(f, "SCALAR"),
        }
    }
}

/// Position of a child under its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    /// Named field of a map
    Field(String),
    /// Position in a list
    Index(u32),
}

impl Slot {
    /// Kind of container that owns this slot type.
    #[must_use]
    pub fn container_kind(&self) -> NodeKind {
        match self {
            Slot::Field(_) => NodeKind::Map,
            Slot::Index(_) => NodeKind::List,
        }
    }
}

/// A single node in the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    kind: NodeKind,
    value: Option<String>,
    children: BTreeMap<Slot, NodeId>,
}

impl Node {
    fn new(kind: NodeKind, value: Option<String>) -> Self {
        Self {
            kind,
            value,
            children: BTreeMap::new(),
        }
    }

    /// Kind of this node.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Scalar payload, if any.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Child installed under a field name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<NodeId> {
        self.children.get(&Slot::Field(name.to_string())).copied()
    }

    /// Child installed at a list position.
    #[must_use]
    pub fn index(&self, index: u32) -> Option<NodeId> {
        self.children.get(&Slot::Index(index)).copied()
    }

    /// Children in slot order.
    pub fn children(&self) -> impl Iterator<Item = (&Slot, NodeId)> {
        self.children.iter().map(|(slot, id)| (slot, *id))
    }

    /// Whether the node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Reversal record for one applied action.
#[derive(Debug)]
enum Undo {
    Nothing,
    Installed {
        id: NodeId,
        link: Option<(NodeId, Slot)>,
        high_water: Option<NodeId>,
    },
    Removed {
        parent: NodeId,
        links: Vec<(Slot, NodeId)>,
        nodes: Vec<(NodeId, Node)>,
    },
}

/// Arena of live nodes plus the allocation high-water mark.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    root: Option<NodeId>,
    nodes: HashMap<NodeId, Node>,
    high_water: Option<NodeId>,
}

/// Two tables are equal when they hold the same live tree. High-water marks
/// are not compared: a mirror built from a snapshot never saw removed ids
/// above its last live one.
impl PartialEq for NodeTable {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.nodes == other.nodes
    }
}

impl Eq for NodeTable {}

impl NodeTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root id, once installed.
    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Look up a live node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Whether the id has been deallocated: issued once, no longer live.
    #[must_use]
    pub fn is_retired(&self, id: NodeId) -> bool {
        self.high_water.is_some_and(|high| id <= high) && !self.nodes.contains_key(&id)
    }

    /// Highest id ever installed in this table.
    #[must_use]
    pub fn high_water(&self) -> Option<NodeId> {
        self.high_water
    }

    /// Treat every id up to `id` as issued. Used after recovery, where ids
    /// removed since the baseline sit above the highest live one.
    pub fn retire_through(&mut self, id: NodeId) {
        self.high_water = Some(self.high_water.map_or(id, |current| current.max(id)));
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over live ids (unordered).
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Resolve a live node, classifying unknown and retired ids.
    ///
    /// # Errors
    ///
    /// Returns `Deallocated` for retired ids and `UnknownNode` otherwise.
    pub fn live(&self, id: NodeId) -> Result<&Node> {
        if let Some(node) = self.nodes.get(&id) {
            return Ok(node);
        }
        if self.is_retired(id) {
            Err(Violation::Deallocated(id).into())
        } else {
            Err(Violation::UnknownNode(id).into())
        }
    }

    /// Resolve a parent that must be a container of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `DanglingParent`, `Deallocated` or `WrongKind`.
    pub fn container(&self, id: NodeId, expected: NodeKind) -> Result<&Node> {
        let node = match self.nodes.get(&id) {
            Some(node) => node,
            None if self.is_retired(id) => return Err(Violation::Deallocated(id).into()),
            None => return Err(Violation::DanglingParent(id).into()),
        };
        if node.kind != expected {
            return Err(Violation::WrongKind {
                id,
                expected,
                actual: node.kind,
            }
            .into());
        }
        Ok(node)
    }

    /// Apply a single action. Returns the ids it deallocated.
    ///
    /// Validation runs before any mutation, so a failed action leaves the
    /// table untouched.
    ///
    /// # Errors
    ///
    /// Returns a contract violation if the action is illegal here.
    pub fn apply(&mut self, action: &Action) -> Result<Vec<NodeId>> {
        self.apply_one(action).map(|(deallocated, _)| deallocated)
    }

    /// Apply a batch atomically: either every action lands or none does.
    ///
    /// # Errors
    ///
    /// Returns the first failing action's violation after rolling back.
    pub fn apply_batch(&mut self, actions: &[Action]) -> Result<()> {
        let mut journal = Vec::with_capacity(actions.len());
        for action in actions {
            match self.apply_one(action) {
                Ok((_, undo)) => journal.push(undo),
                Err(err) => {
                    for undo in journal.into_iter().rev() {
                        self.rollback(undo);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// The minimal action sequence that rebuilds this tree from empty, in
    /// ascending id order. A child is always issued after its parent, so
    /// this order also installs every parent first.
    #[must_use]
    pub fn snapshot_actions(&self) -> Vec<Action> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let Some(root_node) = self.nodes.get(&root) else {
            return Vec::new();
        };

        let mut actions = Vec::with_capacity(self.nodes.len());
        actions.push((
            root,
            Action::InstallRoot {
                id: root,
                kind: root_node.kind,
                value: root_node.value.clone(),
            },
        ));

        let mut stack = vec![root];
        while let Some(parent) = stack.pop() {
            let Some(node) = self.nodes.get(&parent) else {
                continue;
            };
            for (slot, &id) in &node.children {
                let Some(child) = self.nodes.get(&id) else {
                    continue;
                };
                let value = child.value.clone();
                let install = match slot {
                    Slot::Field(name) => Action::InstallField {
                        parent,
                        id,
                        name: name.clone(),
                        kind: child.kind,
                        value,
                    },
                    Slot::Index(index) => Action::InstallIndex {
                        parent,
                        id,
                        index: *index,
                        kind: child.kind,
                        value,
                    },
                };
                actions.push((id, install));
            }
            stack.extend(node.children.values().copied());
        }
        actions.sort_unstable_by_key(|(id, _)| *id);
        actions.into_iter().map(|(_, action)| action).collect()
    }

    fn apply_one(&mut self, action: &Action) -> Result<(Vec<NodeId>, Undo)> {
        match action {
            Action::InstallRoot { id, kind, value } => {
                let undo = self.install(None, *id, *kind, value.as_deref())?;
                Ok((Vec::new(), undo))
            }
            Action::InstallField {
                parent,
                id,
                name,
                kind,
                value,
            } => {
                let link = Some((*parent, Slot::Field(name.clone())));
                let undo = self.install(link, *id, *kind, value.as_deref())?;
                Ok((Vec::new(), undo))
            }
            Action::InstallIndex {
                parent,
                id,
                index,
                kind,
                value,
            } => {
                let link = Some((*parent, Slot::Index(*index)));
                let undo = self.install(link, *id, *kind, value.as_deref())?;
                Ok((Vec::new(), undo))
            }
            Action::RemoveField {
                parent, id, name, ..
            } => self.remove_field(*parent, *id, name),
            Action::RemoveChildren { id, .. } => self.remove_children(*id),
            Action::TerminateHeap => Ok((Vec::new(), Undo::Nothing)),
        }
    }

    fn install(
        &mut self,
        link: Option<(NodeId, Slot)>,
        id: NodeId,
        kind: NodeKind,
        value: Option<&str>,
    ) -> Result<Undo> {
        match &link {
            None => {
                if self.root.is_some() {
                    return Err(Violation::RootAlreadyInstalled.into());
                }
            }
            Some((parent, slot)) => {
                let container = self.container(*parent, slot.container_kind())?;
                if container.children.contains_key(slot) {
                    return Err(match slot {
                        Slot::Field(name) => Violation::DuplicateField {
                            parent: *parent,
                            name: name.clone(),
                        },
                        Slot::Index(index) => Violation::OccupiedIndex {
                            parent: *parent,
                            index: *index,
                        },
                    }
                    .into());
                }
            }
        }
        if self.nodes.contains_key(&id) {
            return Err(Violation::DuplicateId(id).into());
        }
        if self.is_retired(id) {
            return Err(Violation::Deallocated(id).into());
        }
        if value.is_some() && kind != NodeKind::Scalar {
            return Err(Violation::ValueOnContainer(id).into());
        }

        let high_water = self.high_water;
        self.high_water = Some(high_water.map_or(id, |current| current.max(id)));
        self.nodes
            .insert(id, Node::new(kind, value.map(str::to_string)));
        match &link {
            None => self.root = Some(id),
            Some((parent, slot)) => {
                if let Some(container) = self.nodes.get_mut(parent) {
                    container.children.insert(slot.clone(), id);
                }
            }
        }
        Ok(Undo::Installed {
            id,
            link,
            high_water,
        })
    }

    fn remove_field(&mut self, parent: NodeId, id: NodeId, name: &str) -> Result<(Vec<NodeId>, Undo)> {
        let slot = Slot::Field(name.to_string());
        let held = self.container(parent, NodeKind::Map)?.children.get(&slot).copied();
        match held {
            None => {
                if self.is_retired(id) {
                    return Err(Violation::Deallocated(id).into());
                }
                return Err(Violation::MissingField {
                    parent,
                    name: name.to_string(),
                }
                .into());
            }
            Some(held) if held != id => {
                return Err(Violation::FieldMismatch {
                    parent,
                    name: name.to_string(),
                    id,
                }
                .into());
            }
            Some(_) => {}
        }

        if let Some(container) = self.nodes.get_mut(&parent) {
            container.children.remove(&slot);
        }
        let nodes = self.retire_subtree(id);
        let deallocated = nodes.iter().map(|(id, _)| *id).collect();
        Ok((
            deallocated,
            Undo::Removed {
                parent,
                links: vec![(slot, id)],
                nodes,
            },
        ))
    }

    fn remove_children(&mut self, id: NodeId) -> Result<(Vec<NodeId>, Undo)> {
        self.live(id)?;
        let links: Vec<(Slot, NodeId)> = match self.nodes.get_mut(&id) {
            Some(node) => std::mem::take(&mut node.children).into_iter().collect(),
            None => Vec::new(),
        };

        let mut nodes = Vec::new();
        for (_, child) in &links {
            nodes.extend(self.retire_subtree(*child));
        }
        let deallocated = nodes.iter().map(|(id, _)| *id).collect();
        Ok((
            deallocated,
            Undo::Removed {
                parent: id,
                links,
                nodes,
            },
        ))
    }

    fn retire_subtree(&mut self, top: NodeId) -> Vec<(NodeId, Node)> {
        let mut removed = Vec::new();
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                stack.extend(node.children.values().copied());
                removed.push((id, node));
            }
        }
        removed
    }

    fn rollback(&mut self, undo: Undo) {
        match undo {
            Undo::Nothing => {}
            Undo::Installed {
                id,
                link,
                high_water,
            } => {
                self.nodes.remove(&id);
                match link {
                    None => self.root = None,
                    Some((parent, slot)) => {
                        if let Some(container) = self.nodes.get_mut(&parent) {
                            container.children.remove(&slot);
                        }
                    }
                }
                self.high_water = high_water;
            }
            Undo::Removed {
                parent,
                links,
                nodes,
            } => {
                self.nodes.extend(nodes);
                if let Some(container) = self.nodes.get_mut(&parent) {
                    container.children.extend(links);
                }
            }
        }
    }
}
