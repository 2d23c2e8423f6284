//! Per-heap subscriber registry and in-order fan-out.
//!
//! Each subscriber owns a bounded queue. Delivery never blocks the writer:
//! a subscriber whose queue is full is dropped as stalled and its receiver
//! sees a transport failure once it has drained what was already queued.

use crate::action::{InitialUpdate, Update};
use crate::error::{HeapError, Result, Violation};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Subscriber identifier.
pub type SubscriberId = Uuid;

/// One item in a subscriber's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Baseline that carries the subscriber from empty state
    Initial(Arc<InitialUpdate>),
    /// Batch committed after the baseline
    Update(Arc<Update>),
}

impl Delivery {
    /// The carried batch.
    #[must_use]
    pub fn update(&self) -> &Update {
        match self {
            Delivery::Initial(initial) => initial.as_update(),
            Delivery::Update(update) => update,
        }
    }

    /// Whether this is the baseline.
    #[must_use]
    pub fn is_initial(&self) -> bool {
        matches!(self, Delivery::Initial(_))
    }
}

/// Why a subscription stopped receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Removed by `unsubscribe`
    Unsubscribed,
    /// Dropped because its queue was full
    Stalled,
    /// The heap terminated after delivering `TerminateHeap`
    Terminated,
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    heap_id: String,
    rx: mpsc::Receiver<Delivery>,
    closed: Arc<OnceLock<CloseReason>>,
}

impl Subscription {
    /// Subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Heap this subscription follows.
    #[must_use]
    pub fn heap_id(&self) -> &str {
        &self.heap_id
    }

    /// Reason the stream closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.get().copied()
    }

    /// Next delivery, or `None` once the stream ended normally.
    ///
    /// # Errors
    ///
    /// Returns `TransportFailure` after the last queued delivery if the
    /// subscriber was dropped for stalling.
    pub async fn recv(&mut self) -> Result<Option<Delivery>> {
        match self.rx.recv().await {
            Some(delivery) => Ok(Some(delivery)),
            None => self.end_of_stream(),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `Ok(None)` means either
    /// nothing is queued yet or the stream ended; check
    /// [`close_reason`](Self::close_reason) to tell them apart.
    ///
    /// # Errors
    ///
    /// Same as [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Option<Delivery>> {
        match self.rx.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => self.end_of_stream(),
        }
    }

    fn end_of_stream(&self) -> Result<Option<Delivery>> {
        match self.close_reason() {
            Some(CloseReason::Stalled) => Err(HeapError::TransportFailure(format!(
                "subscriber {} fell behind on heap {}",
                self.id, self.heap_id
            ))),
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
struct Slot {
    tx: mpsc::Sender<Delivery>,
    closed: Arc<OnceLock<CloseReason>>,
    awaiting_baseline: bool,
}

impl Slot {
    fn close(self, reason: CloseReason) {
        let _ = self.closed.set(reason);
    }
}

/// Registry of live subscribers for one heap.
#[derive(Debug)]
pub struct SubscriptionManager {
    heap_id: String,
    capacity: usize,
    slots: HashMap<SubscriberId, Slot>,
    terminated: bool,
}

impl SubscriptionManager {
    /// Create a registry whose subscribers queue at most `capacity` items.
    #[must_use]
    pub fn new(heap_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            heap_id: heap_id.into(),
            capacity: capacity.max(1),
            slots: HashMap::new(),
            terminated: false,
        }
    }

    /// Register a subscriber.
    ///
    /// `baseline` is the snapshot taken at the current consistent point; it
    /// is queued first. Without one the heap is still empty and the
    /// subscriber's first update is delivered as its baseline instead.
    ///
    /// # Errors
    ///
    /// Returns `HeapTerminated` once the heap has ended.
    pub fn subscribe(&mut self, baseline: Option<InitialUpdate>) -> Result<Subscription> {
        if self.terminated {
            return Err(Violation::HeapTerminated.into());
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let closed = Arc::new(OnceLock::new());
        let id = Uuid::new_v4();

        let awaiting_baseline = match baseline {
            Some(initial) => {
                // Fresh channel with capacity >= 1: cannot be full
                tx.try_send(Delivery::Initial(Arc::new(initial)))
                    .map_err(|_| HeapError::TransportFailure("subscriber channel closed".into()))?;
                false
            }
            None => true,
        };

        self.slots.insert(
            id,
            Slot {
                tx,
                closed: Arc::clone(&closed),
                awaiting_baseline,
            },
        );
        tracing::info!(
            heap_id = %self.heap_id,
            subscriber_id = %id,
            subscribers = self.slots.len(),
            "Subscriber added"
        );

        Ok(Subscription {
            id,
            heap_id: self.heap_id.clone(),
            rx,
            closed,
        })
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        match self.slots.remove(&id) {
            Some(slot) => {
                slot.close(CloseReason::Unsubscribed);
                tracing::info!(heap_id = %self.heap_id, subscriber_id = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Queue `update` for every subscriber, in commit order.
    ///
    /// A terminating update is delivered and then every subscription is
    /// released.
    pub fn publish(&mut self, update: &Arc<Update>) {
        let mut dropped = Vec::new();
        for (id, slot) in &mut self.slots {
            let delivery = if slot.awaiting_baseline {
                Delivery::Initial(Arc::new(InitialUpdate::from_update(Update::clone(update))))
            } else {
                Delivery::Update(Arc::clone(update))
            };
            match slot.tx.try_send(delivery) {
                Ok(()) => slot.awaiting_baseline = false,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        heap_id = %self.heap_id,
                        subscriber_id = %id,
                        capacity = self.capacity,
                        "Subscriber stalled, dropping"
                    );
                    dropped.push((*id, CloseReason::Stalled));
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        heap_id = %self.heap_id,
                        subscriber_id = %id,
                        "Subscriber receiver dropped"
                    );
                    dropped.push((*id, CloseReason::Unsubscribed));
                }
            }
        }
        for (id, reason) in dropped {
            if let Some(slot) = self.slots.remove(&id) {
                slot.close(reason);
            }
        }

        tracing::debug!(
            heap_id = %self.heap_id,
            actions = update.len(),
            subscribers = self.slots.len(),
            "Published update"
        );

        if update.terminates() {
            self.terminated = true;
            for (_, slot) in self.slots.drain() {
                slot.close(CloseReason::Terminated);
            }
            tracing::info!(heap_id = %self.heap_id, "Released subscribers on termination");
        }
    }

    /// Mark the heap ended without a new publish, e.g. after recovering a
    /// terminated heap from its log.
    pub fn mark_terminated(&mut self) {
        self.terminated = true;
        for (_, slot) in self.slots.drain() {
            slot.close(CloseReason::Terminated);
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no subscriber is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the heap has ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
