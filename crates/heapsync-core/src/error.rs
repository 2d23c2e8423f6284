//! Error taxonomy for the heap protocol.
//!
//! Nothing here is retried. A heap or subscription that observes an error
//! is discarded and, for subscribers, rebuilt from a fresh snapshot.

use crate::node::{NodeId, NodeKind};

/// A broken protocol rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// A mutation primitive was called outside `begin_update`/`end_update`
    #[error("no update in progress")]
    NoUpdateInProgress,
    /// `begin_update` was called while a batch was already open
    #[error("update already in progress")]
    UpdateInProgress,
    /// The heap has been terminated
    #[error("heap terminated")]
    HeapTerminated,
    /// A second root was installed
    #[error("root already installed")]
    RootAlreadyInstalled,
    /// The parent id is not part of the tree
    #[error("dangling parent {0}")]
    DanglingParent(NodeId),
    /// The node id is not part of the tree
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// The node id was deallocated earlier
    #[error("reference to deallocated node {0}")]
    Deallocated(NodeId),
    /// The node id is already installed
    #[error("node {0} already installed")]
    DuplicateId(NodeId),
    /// A map already holds a field with this name
    #[error("node {parent} already has field {name:?}")]
    DuplicateField {
        /// Map node
        parent: NodeId,
        /// Field name
        name: String,
    },
    /// A map holds no field with this name
    #[error("node {parent} has no field {name:?}")]
    MissingField {
        /// Map node
        parent: NodeId,
        /// Field name
        name: String,
    },
    /// A field exists but holds a different node than the one named
    #[error("field {name:?} of node {parent} does not hold node {id}")]
    FieldMismatch {
        /// Map node
        parent: NodeId,
        /// Field name
        name: String,
        /// Node the action referred to
        id: NodeId,
    },
    /// A list position is already taken
    #[error("index {index} of node {parent} is occupied")]
    OccupiedIndex {
        /// List node
        parent: NodeId,
        /// List position
        index: u32,
    },
    /// A node has the wrong kind for the operation
    #[error("node {id} is {actual}, expected {expected}")]
    WrongKind {
        /// Offending node
        id: NodeId,
        /// Kind the operation needs
        expected: NodeKind,
        /// Kind the node has
        actual: NodeKind,
    },
    /// A value was attached to a map or list
    #[error("value attached to non-scalar node {0}")]
    ValueOnContainer(NodeId),
    /// An update with no actions
    #[error("empty update")]
    EmptyUpdate,
    /// An action followed `TerminateHeap`
    #[error("action after heap termination")]
    ActionAfterTermination,
    /// An update arrived before the initial update
    #[error("update received before initial update")]
    NotInitialized,
    /// A second initial update arrived
    #[error("initial update already applied")]
    AlreadyInitialized,
    /// The 32-bit id space is used up
    #[error("node id space exhausted")]
    IdSpaceExhausted,
}

/// A field list that does not describe a valid action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// A required field was absent
    #[error("missing field {0}")]
    Missing(&'static str),
    /// A field had the wrong primitive type
    #[error("field {0} has the wrong type")]
    TypeMismatch(&'static str),
    /// A node kind code outside MAP/LIST/SCALAR
    #[error("unknown node kind code {0}")]
    UnknownKind(i32),
    /// An action tag outside the closed action set
    #[error("unknown action tag {0}")]
    UnknownTag(u8),
}

/// Errors surfaced by heaps, subscriptions and mirrors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// A protocol rule was broken; fatal, never retried
    #[error("contract violation: {0}")]
    ContractViolation(#[from] Violation),
    /// Delivery to a subscriber failed or fell behind
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// Malformed wire data for an action
    #[error("codec failure: {0}")]
    CodecFailure(String),
    /// The durable action log rejected a read or write
    #[error("action log failure: {0}")]
    Log(String),
}

impl HeapError {
    /// The broken rule, if this is a contract violation.
    #[must_use]
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            HeapError::ContractViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

impl From<FieldError> for HeapError {
    fn from(err: FieldError) -> Self {
        HeapError::CodecFailure(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = HeapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_messages() {
        let err = HeapError::from(Violation::HeapTerminated);
        assert_eq!(err.to_string(), "contract violation: heap terminated");

        let err = HeapError::from(Violation::DanglingParent(NodeId(99)));
        assert_eq!(err.to_string(), "contract violation: dangling parent 99");
        assert_eq!(err.violation(), Some(&Violation::DanglingParent(NodeId(99))));
    }

    #[test]
    fn field_errors_are_codec_failures() {
        let err = HeapError::from(FieldError::UnknownKind(7));
        assert!(matches!(err, HeapError::CodecFailure(_)));
        assert!(err.violation().is_none());
    }
}
