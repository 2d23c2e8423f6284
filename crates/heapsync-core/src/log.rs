//! Durable action log seam.
//!
//! A heap's history is a baseline snapshot (after compaction) followed by
//! every update committed since. Replaying that history from empty rebuilds
//! the heap.

use crate::action::{InitialUpdate, Update};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// A compacted prefix of a heap's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    /// Snapshot of the tree at the compaction point
    pub initial: InitialUpdate,
    /// Allocator position at the compaction point
    pub next_id: u64,
}

/// Everything a log holds for one heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggedHistory {
    /// Latest baseline, if the log was compacted
    pub baseline: Option<Baseline>,
    /// Updates committed after the baseline, oldest first
    pub updates: Vec<Update>,
}

/// Append-only store for one heap's committed updates.
pub trait ActionLog: Send {
    /// Persist a committed update.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::Log` if the write fails.
    fn append(&mut self, update: &Update) -> Result<()>;

    /// Replace everything logged so far with a baseline.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::Log` if the write fails.
    fn compact(&mut self, baseline: &Baseline) -> Result<()>;

    /// Read the full history.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::Log` if the read fails or data is corrupt.
    fn load(&mut self) -> Result<LoggedHistory>;
}

/// In-memory log. Clones share the same history.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    history: Arc<Mutex<LoggedHistory>>,
}

impl MemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current history.
    #[must_use]
    pub fn history(&self) -> LoggedHistory {
        self.history.lock().clone()
    }
}

impl ActionLog for MemoryLog {
    fn append(&mut self, update: &Update) -> Result<()> {
        self.history.lock().updates.push(update.clone());
        Ok(())
    }

    fn compact(&mut self, baseline: &Baseline) -> Result<()> {
        let mut history = self.history.lock();
        history.baseline = Some(baseline.clone());
        history.updates.clear();
        Ok(())
    }

    fn load(&mut self) -> Result<LoggedHistory> {
        Ok(self.history())
    }
}
