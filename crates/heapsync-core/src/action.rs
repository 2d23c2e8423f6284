//! Structural mutation actions and the atomic batches that carry them.
//!
//! The action set is closed. Every action describes itself as an ordered
//! list of typed fields; that list is the wire contract and only ever grows
//! at the end.

use crate::error::{FieldError, Result, Violation};
use crate::node::{NodeId, NodeKind};
use serde::{Deserialize, Serialize};

/// Primitive type of a transcribed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 32-bit signed integer
    Int32,
    /// UTF-8 string
    String,
    /// UTF-8 string that may be absent
    OptString,
    /// Ordered list of tagged actions
    ActionList,
}

/// Name and type of one field in an action's wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    /// Field name
    pub name: &'static str,
    /// Primitive type
    pub field_type: FieldType,
}

impl FieldDescriptor {
    /// Describe a field.
    #[must_use]
    pub const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type }
    }
}

/// A field value in transcription order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// 32-bit signed integer
    Int32(i32),
    /// UTF-8 string
    String(String),
    /// Optional UTF-8 string
    OptString(Option<String>),
    /// Nested action list
    Actions(Vec<Action>),
}

const PARENT: FieldDescriptor = FieldDescriptor::new("parent", FieldType::Int32);
const ID: FieldDescriptor = FieldDescriptor::new("id", FieldType::Int32);
const NAME: FieldDescriptor = FieldDescriptor::new("name", FieldType::String);
const INDEX: FieldDescriptor = FieldDescriptor::new("index", FieldType::Int32);
const KIND: FieldDescriptor = FieldDescriptor::new("type", FieldType::Int32);
const VALUE: FieldDescriptor = FieldDescriptor::new("value", FieldType::OptString);

const INSTALL_ROOT_FIELDS: &[FieldDescriptor] = &[ID, KIND, VALUE];
const INSTALL_FIELD_FIELDS: &[FieldDescriptor] = &[PARENT, ID, NAME, KIND, VALUE];
const INSTALL_INDEX_FIELDS: &[FieldDescriptor] = &[PARENT, ID, INDEX, KIND, VALUE];
const REMOVE_FIELD_FIELDS: &[FieldDescriptor] = &[PARENT, ID, NAME];
const REMOVE_CHILDREN_FIELDS: &[FieldDescriptor] = &[ID];
const TERMINATE_FIELDS: &[FieldDescriptor] = &[];

/// Discriminant of an action, carried beside its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionTag {
    /// [`Action::InstallRoot`]
    InstallRoot = 1,
    /// [`Action::InstallField`]
    InstallField = 2,
    /// [`Action::InstallIndex`]
    InstallIndex = 3,
    /// [`Action::RemoveField`]
    RemoveField = 4,
    /// [`Action::RemoveChildren`]
    RemoveChildren = 5,
    /// [`Action::TerminateHeap`]
    TerminateHeap = 6,
}

impl ActionTag {
    /// Parse a wire tag.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTag` for values outside the action set.
    pub fn from_u8(tag: u8) -> Result<Self, FieldError> {
        Ok(match tag {
            1 => ActionTag::InstallRoot,
            2 => ActionTag::InstallField,
            3 => ActionTag::InstallIndex,
            4 => ActionTag::RemoveField,
            5 => ActionTag::RemoveChildren,
            6 => ActionTag::TerminateHeap,
            other => return Err(FieldError::UnknownTag(other)),
        })
    }

    /// Ordered wire layout of the tagged action.
    #[must_use]
    pub fn descriptors(self) -> &'static [FieldDescriptor] {
        match self {
            ActionTag::InstallRoot => INSTALL_ROOT_FIELDS,
            ActionTag::InstallField => INSTALL_FIELD_FIELDS,
            ActionTag::InstallIndex => INSTALL_INDEX_FIELDS,
            ActionTag::RemoveField => REMOVE_FIELD_FIELDS,
            ActionTag::RemoveChildren => REMOVE_CHILDREN_FIELDS,
            ActionTag::TerminateHeap => TERMINATE_FIELDS,
        }
    }
}

/// Ids retired by a removal, as seen by the sender.
///
/// Sender-local bookkeeping only: never transcribed, and equal to every
/// other set so it never affects action identity. Receivers derive the same
/// ids by walking the removed subtree.
#[derive(Debug, Clone, Default)]
pub struct DeallocatedIds(Vec<NodeId>);

impl DeallocatedIds {
    /// The recorded ids.
    #[must_use]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}

impl From<Vec<NodeId>> for DeallocatedIds {
    fn from(ids: Vec<NodeId>) -> Self {
        Self(ids)
    }
}

impl PartialEq for DeallocatedIds {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for DeallocatedIds {}

/// One structural mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Install the heap root
    InstallRoot {
        /// New node id
        id: NodeId,
        /// Kind of the root
        kind: NodeKind,
        /// Scalar payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Install a named field under a map
    InstallField {
        /// Map node
        parent: NodeId,
        /// New node id
        id: NodeId,
        /// Field name
        name: String,
        /// Kind of the new node
        kind: NodeKind,
        /// Scalar payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Install a positional child under a list
    InstallIndex {
        /// List node
        parent: NodeId,
        /// New node id
        id: NodeId,
        /// List position
        index: u32,
        /// Kind of the new node
        kind: NodeKind,
        /// Scalar payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Remove a named field and its subtree
    RemoveField {
        /// Map node
        parent: NodeId,
        /// Node held by the field
        id: NodeId,
        /// Field name
        name: String,
        /// Sender-side record of retired ids
        #[serde(skip)]
        deallocated: DeallocatedIds,
    },
    /// Remove every child of a node
    RemoveChildren {
        /// Container node
        id: NodeId,
        /// Sender-side record of retired ids
        #[serde(skip)]
        deallocated: DeallocatedIds,
    },
    /// End of the heap
    TerminateHeap,
}

impl Action {
    /// `InstallRoot(id, kind)`.
    #[must_use]
    pub fn install_root(id: NodeId, kind: NodeKind) -> Self {
        Action::InstallRoot {
            id,
            kind,
            value: None,
        }
    }

    /// `InstallField(parent, id, name, kind)`.
    #[must_use]
    pub fn install_field(parent: NodeId, id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        Action::InstallField {
            parent,
            id,
            name: name.into(),
            kind,
            value: None,
        }
    }

    /// `InstallIndex(parent, id, index, kind)`.
    #[must_use]
    pub fn install_index(parent: NodeId, id: NodeId, index: u32, kind: NodeKind) -> Self {
        Action::InstallIndex {
            parent,
            id,
            index,
            kind,
            value: None,
        }
    }

    /// `RemoveField(parent, id, name)`.
    #[must_use]
    pub fn remove_field(parent: NodeId, id: NodeId, name: impl Into<String>) -> Self {
        Action::RemoveField {
            parent,
            id,
            name: name.into(),
            deallocated: DeallocatedIds::default(),
        }
    }

    /// `RemoveChildren(id)`.
    #[must_use]
    pub fn remove_children(id: NodeId) -> Self {
        Action::RemoveChildren {
            id,
            deallocated: DeallocatedIds::default(),
        }
    }

    /// Attach a scalar payload to an install action. Other actions are
    /// returned unchanged.
    #[must_use]
    pub fn with_value(mut self, payload: impl Into<String>) -> Self {
        if let Action::InstallRoot { value, .. }
        | Action::InstallField { value, .. }
        | Action::InstallIndex { value, .. } = &mut self
        {
            *value = Some(payload.into());
        }
        self
    }

    /// Discriminant.
    #[must_use]
    pub fn tag(&self) -> ActionTag {
        match self {
            Action::InstallRoot { .. } => ActionTag::InstallRoot,
            Action::InstallField { .. } => ActionTag::InstallField,
            Action::InstallIndex { .. } => ActionTag::InstallIndex,
            Action::RemoveField { .. } => ActionTag::RemoveField,
            Action::RemoveChildren { .. } => ActionTag::RemoveChildren,
            Action::TerminateHeap => ActionTag::TerminateHeap,
        }
    }

    /// Ordered wire layout.
    #[must_use]
    pub fn descriptors(&self) -> &'static [FieldDescriptor] {
        self.tag().descriptors()
    }

    /// Field values in descriptor order.
    #[must_use]
    pub fn field_values(&self) -> Vec<FieldValue> {
        match self {
            Action::InstallRoot { id, kind, value } => vec![
                FieldValue::Int32(to_wire(id.0)),
                FieldValue::Int32(kind.code()),
                FieldValue::OptString(value.clone()),
            ],
            Action::InstallField {
                parent,
                id,
                name,
                kind,
                value,
            } => vec![
                FieldValue::Int32(to_wire(parent.0)),
                FieldValue::Int32(to_wire(id.0)),
                FieldValue::String(name.clone()),
                FieldValue::Int32(kind.code()),
                FieldValue::OptString(value.clone()),
            ],
            Action::InstallIndex {
                parent,
                id,
                index,
                kind,
                value,
            } => vec![
                FieldValue::Int32(to_wire(parent.0)),
                FieldValue::Int32(to_wire(id.0)),
                FieldValue::Int32(to_wire(*index)),
                FieldValue::Int32(kind.code()),
                FieldValue::OptString(value.clone()),
            ],
            Action::RemoveField {
                parent, id, name, ..
            } => vec![
                FieldValue::Int32(to_wire(parent.0)),
                FieldValue::Int32(to_wire(id.0)),
                FieldValue::String(name.clone()),
            ],
            Action::RemoveChildren { id, .. } => vec![FieldValue::Int32(to_wire(id.0))],
            Action::TerminateHeap => Vec::new(),
        }
    }

    /// Rebuild an action from its tag and field values.
    ///
    /// Values beyond the known layout are ignored; missing trailing optional
    /// values read as absent.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] if a required field is missing or mistyped.
    pub fn from_fields(tag: ActionTag, values: Vec<FieldValue>) -> Result<Self, FieldError> {
        let mut fields = Fields {
            values: values.into_iter(),
        };
        Ok(match tag {
            ActionTag::InstallRoot => Action::InstallRoot {
                id: NodeId(fields.id(ID)?),
                kind: fields.kind()?,
                value: fields.opt_string(VALUE)?,
            },
            ActionTag::InstallField => Action::InstallField {
                parent: NodeId(fields.id(PARENT)?),
                id: NodeId(fields.id(ID)?),
                name: fields.string(NAME)?,
                kind: fields.kind()?,
                value: fields.opt_string(VALUE)?,
            },
            ActionTag::InstallIndex => Action::InstallIndex {
                parent: NodeId(fields.id(PARENT)?),
                id: NodeId(fields.id(ID)?),
                index: fields.id(INDEX)?,
                kind: fields.kind()?,
                value: fields.opt_string(VALUE)?,
            },
            ActionTag::RemoveField => Action::RemoveField {
                parent: NodeId(fields.id(PARENT)?),
                id: NodeId(fields.id(ID)?),
                name: fields.string(NAME)?,
                deallocated: DeallocatedIds::default(),
            },
            ActionTag::RemoveChildren => Action::RemoveChildren {
                id: NodeId(fields.id(ID)?),
                deallocated: DeallocatedIds::default(),
            },
            ActionTag::TerminateHeap => Action::TerminateHeap,
        })
    }

    /// Whether this is `TerminateHeap`.
    #[must_use]
    pub fn is_terminate(&self) -> bool {
        matches!(self, Action::TerminateHeap)
    }

    /// Ids the sender recorded as deallocated by this action.
    #[must_use]
    pub fn deallocated(&self) -> &[NodeId] {
        match self {
            Action::RemoveField { deallocated, .. } | Action::RemoveChildren { deallocated, .. } => {
                deallocated.as_slice()
            }
            _ => &[],
        }
    }

    pub(crate) fn record_deallocated(&mut self, ids: Vec<NodeId>) {
        if let Action::RemoveField { deallocated, .. } | Action::RemoveChildren { deallocated, .. } =
            self
        {
            *deallocated = DeallocatedIds::from(ids);
        }
    }
}

/// Ids and indices travel as the bit pattern of the `u32` in an `i32`.
fn to_wire(raw: u32) -> i32 {
    i32::from_ne_bytes(raw.to_ne_bytes())
}

fn from_wire(raw: i32) -> u32 {
    u32::from_ne_bytes(raw.to_ne_bytes())
}

struct Fields {
    values: std::vec::IntoIter<FieldValue>,
}

impl Fields {
    fn int(&mut self, field: FieldDescriptor) -> Result<i32, FieldError> {
        match self.values.next() {
            Some(FieldValue::Int32(value)) => Ok(value),
            Some(_) => Err(FieldError::TypeMismatch(field.name)),
            None => Err(FieldError::Missing(field.name)),
        }
    }

    fn id(&mut self, field: FieldDescriptor) -> Result<u32, FieldError> {
        self.int(field).map(from_wire)
    }

    fn kind(&mut self) -> Result<NodeKind, FieldError> {
        let code = self.int(KIND)?;
        NodeKind::from_code(code).ok_or(FieldError::UnknownKind(code))
    }

    fn string(&mut self, field: FieldDescriptor) -> Result<String, FieldError> {
        match self.values.next() {
            Some(FieldValue::String(value)) => Ok(value),
            Some(_) => Err(FieldError::TypeMismatch(field.name)),
            None => Err(FieldError::Missing(field.name)),
        }
    }

    fn opt_string(&mut self, field: FieldDescriptor) -> Result<Option<String>, FieldError> {
        match self.values.next() {
            Some(FieldValue::OptString(value)) => Ok(value),
            Some(_) => Err(FieldError::TypeMismatch(field.name)),
            None => Ok(None),
        }
    }
}

/// Capability a consumer exposes to receive batches.
///
/// `apply_update` is the single point where a batch becomes visible and
/// must be transactional: on error nothing from `actions` may remain.
pub trait HeapListener {
    /// Apply one ordered batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be applied; state is unchanged.
    fn apply_update(&mut self, actions: &[Action]) -> Result<()>;
}

/// Wire layout of an update: a single nested action list.
pub const UPDATE_FIELDS: &[FieldDescriptor] =
    &[FieldDescriptor::new("actions", FieldType::ActionList)];

/// An ordered, non-empty batch of actions applied as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Update {
    actions: Vec<Action>,
}

impl Update {
    /// Build an update.
    ///
    /// # Errors
    ///
    /// Returns `EmptyUpdate` if `actions` is empty.
    pub fn new(actions: Vec<Action>) -> Result<Self> {
        if actions.is_empty() {
            return Err(Violation::EmptyUpdate.into());
        }
        Ok(Self { actions })
    }

    /// Actions in application order.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Consume into the action list.
    #[must_use]
    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }

    /// Number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether the batch ends the heap.
    #[must_use]
    pub fn terminates(&self) -> bool {
        self.actions.iter().any(Action::is_terminate)
    }

    /// Hand the whole batch to `listener` in one call.
    ///
    /// # Errors
    ///
    /// Propagates the listener's error.
    pub fn apply<L: HeapListener + ?Sized>(&self, listener: &mut L) -> Result<()> {
        listener.apply_update(&self.actions)
    }
}

/// An update that carries a new subscriber from empty to current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitialUpdate(Update);

impl InitialUpdate {
    /// Build an initial update.
    ///
    /// # Errors
    ///
    /// Returns `EmptyUpdate` if `actions` is empty.
    pub fn new(actions: Vec<Action>) -> Result<Self> {
        Update::new(actions).map(Self)
    }

    /// Promote an ordinary update replayable from empty state.
    #[must_use]
    pub fn from_update(update: Update) -> Self {
        Self(update)
    }

    /// The underlying batch.
    #[must_use]
    pub fn as_update(&self) -> &Update {
        &self.0
    }

    /// Actions in application order.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        self.0.actions()
    }

    /// Hand the whole batch to `listener` in one call.
    ///
    /// # Errors
    ///
    /// Propagates the listener's error.
    pub fn apply<L: HeapListener + ?Sized>(&self, listener: &mut L) -> Result<()> {
        self.0.apply(listener)
    }
}
