//! # heapsync server
//!
//! Hosts shared heaps and serves their subscribers over MQTT.
//!
//! ## Architecture
//!
//! - **Control**: subscribe and unsubscribe requests arrive on per-heap
//!   control topics
//! - **Forwarding**: one task per client subscription turns deliveries into
//!   sequenced frames on the client's own topic
//! - **Persistence**: every committed update is logged to `SQLite` and
//!   compacted into a baseline periodically
//! - **Status**: the server describes itself in a heap of its own

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod persistence;
pub mod replication;
pub mod runtime;
pub mod status;

pub use config::{ServerConfig, StoreType};
pub use persistence::{SqliteActionLog, SqliteStore};
pub use replication::{MqttTransport, Outgoing, ReplicationError};
pub use runtime::Server;
pub use status::{StatusHeap, STATUS_HEAP_ID};
