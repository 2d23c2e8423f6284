//! # heapsync core
//!
//! Incremental tree synchronization: a single writer mutates a heap (a tree
//! of map, list and scalar nodes) and every subscriber rebuilds an exact
//! mirror by replaying ordered, atomic batches of structural actions.
//!
//! This crate provides:
//! - An id-indexed node arena shared by the writer and its mirrors
//! - The closed action set and atomic `Update` batches
//! - `HeapModel`, the writer with its id allocator
//! - Subscription fan-out with bounded per-subscriber queues
//! - The replay state machine used by consumers
//! - `SharedHeap`, a lock-guarded handle with an optional durable log

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod error;
pub mod heap;
pub mod log;
pub mod node;
pub mod replay;
pub mod shared;
pub mod subscription;

pub use action::{
    Action, ActionTag, FieldDescriptor, FieldType, FieldValue, HeapListener, InitialUpdate, Update,
};
pub use error::{FieldError, HeapError, Result, Violation};
pub use heap::HeapModel;
pub use log::{ActionLog, Baseline, LoggedHistory, MemoryLog};
pub use node::{Node, NodeId, NodeKind, NodeTable, Slot};
pub use replay::{Mirror, ReplayEngine, ReplayState};
pub use shared::{HeapOptions, SharedHeap, Transaction};
pub use subscription::{CloseReason, Delivery, SubscriberId, Subscription, SubscriptionManager};
