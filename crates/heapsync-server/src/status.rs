//! The server's own heap: identity and per-heap subscriber counts.
//!
//! ```text
//! { server_id, version, tenant, started_at,
//!   heaps: { <heap_id>: { subscribers, state } } }
//! ```

use chrono::{DateTime, Utc};
use heapsync_core::{HeapError, HeapOptions, NodeKind, SharedHeap};
use std::sync::Arc;
use uuid::Uuid;

/// Heap id the status heap is served under.
pub const STATUS_HEAP_ID: &str = "status";

/// Writer for the status heap.
#[derive(Debug, Clone)]
pub struct StatusHeap {
    heap: Arc<SharedHeap>,
}

impl StatusHeap {
    /// Create the heap and write the server's identity.
    ///
    /// # Errors
    ///
    /// Returns a contract violation if the first update cannot be built.
    pub fn start(
        server_id: Uuid,
        tenant: &str,
        started_at: DateTime<Utc>,
        options: HeapOptions,
    ) -> Result<Self, HeapError> {
        let heap = Arc::new(SharedHeap::new(STATUS_HEAP_ID, options));
        let mut tx = heap.begin_update()?;
        let root = tx.ensure_root(NodeKind::Map)?;
        tx.set_field(root, "server_id", server_id.to_string())?;
        tx.set_field(root, "version", env!("CARGO_PKG_VERSION"))?;
        tx.set_field(root, "tenant", tenant)?;
        tx.set_field(root, "started_at", started_at.to_rfc3339())?;
        tx.ensure_field(root, "heaps", NodeKind::Map)?;
        tx.commit()?;
        Ok(Self { heap })
    }

    /// The underlying heap, for subscribing.
    #[must_use]
    pub fn heap(&self) -> &Arc<SharedHeap> {
        &self.heap
    }

    /// Record the current state of a hosted heap.
    ///
    /// # Errors
    ///
    /// Returns a contract violation if the status heap was terminated.
    pub fn record(&self, heap: &SharedHeap) -> Result<(), HeapError> {
        let state = if heap.is_terminated() {
            "terminated"
        } else {
            "active"
        };
        let subscribers = heap.subscriber_count().to_string();

        let mut tx = self.heap.begin_update()?;
        let root = tx.ensure_root(NodeKind::Map)?;
        let heaps = tx.ensure_field(root, "heaps", NodeKind::Map)?;
        let entry = tx.ensure_field(heaps, heap.heap_id(), NodeKind::Map)?;
        tx.set_field(entry, "subscribers", subscribers)?;
        tx.set_field(entry, "state", state)?;
        if let Some(update) = tx.commit()? {
            tracing::debug!(
                heap_id = %heap.heap_id(),
                actions = update.len(),
                "Updated status heap"
            );
        }
        Ok(())
    }
}
