//! Protocol messages exchanged over MQTT.

use crate::cbor::{decode_update, encode_update};
use crate::transcription::CodecError;
use heapsync_core::{Delivery, HeapError, InitialUpdate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Whether a frame carries a subscriber's baseline, a later batch, or the
/// end of a subscription the server gave up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// `InitialUpdate`
    Initial,
    /// `Update`
    Update,
    /// Last frame of a dropped subscription; the payload is the UTF-8 reason
    Dropped,
}

/// One delivery on a subscriber's frame topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFrame {
    /// Heap the batch belongs to
    pub heap_id: String,
    /// Per-subscription position, starting at 0 with the baseline
    pub sequence: u64,
    /// Baseline or update
    pub kind: FrameKind,
    /// CBOR-encoded action payload
    pub payload: Vec<u8>,
}

impl UpdateFrame {
    /// Encode a delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the actions cannot be encoded.
    pub fn from_delivery(
        heap_id: impl Into<String>,
        sequence: u64,
        delivery: &Delivery,
    ) -> Result<Self, MessageError> {
        let kind = if delivery.is_initial() {
            FrameKind::Initial
        } else {
            FrameKind::Update
        };
        Ok(Self {
            heap_id: heap_id.into(),
            sequence,
            kind,
            payload: encode_update(delivery.update(), false)?,
        })
    }

    /// Frame telling a subscriber its stream ended and must be resubscribed.
    #[must_use]
    pub fn dropped(heap_id: impl Into<String>, sequence: u64, reason: &str) -> Self {
        Self {
            heap_id: heap_id.into(),
            sequence,
            kind: FrameKind::Dropped,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// Decode the payload back into a delivery.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Dropped` for a dropped-subscription frame, or a
    /// codec error if the payload is not a valid update.
    pub fn to_delivery(&self) -> Result<Delivery, MessageError> {
        match self.kind {
            FrameKind::Initial => {
                let update = decode_update(&self.payload, true)?;
                Ok(Delivery::Initial(Arc::new(InitialUpdate::from_update(update))))
            }
            FrameKind::Update => Ok(Delivery::Update(Arc::new(decode_update(
                &self.payload,
                true,
            )?))),
            FrameKind::Dropped => Err(MessageError::Dropped(
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Request to start receiving a heap's frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Heap to follow
    pub heap_id: String,
    /// Client-chosen id; frames go to this subscriber's topic
    pub subscriber_id: Uuid,
    /// Client version
    pub version: String,
}

impl SubscribeRequest {
    /// Create a request with a fresh subscriber id.
    #[must_use]
    pub fn new(heap_id: impl Into<String>) -> Self {
        Self {
            heap_id: heap_id.into(),
            subscriber_id: Uuid::new_v4(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Request to stop receiving a heap's frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Heap being followed
    pub heap_id: String,
    /// Id from the matching [`SubscribeRequest`]
    pub subscriber_id: Uuid,
}

impl UnsubscribeRequest {
    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Receiver-side check that frames arrive without gaps.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    next: u64,
}

impl SequenceTracker {
    /// Tracker expecting sequence 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence the next frame must carry.
    #[must_use]
    pub fn expected(&self) -> u64 {
        self.next
    }

    /// Accept `frame` if it is the next one in order.
    ///
    /// # Errors
    ///
    /// Returns `TransportFailure` on a gap or repeat; the receiver must
    /// discard its mirror and resubscribe.
    pub fn accept(&mut self, frame: &UpdateFrame) -> Result<(), HeapError> {
        if frame.sequence != self.next {
            return Err(HeapError::TransportFailure(format!(
                "heap {}: expected frame {}, got {}",
                frame.heap_id, self.next, frame.sequence
            )));
        }
        self.next += 1;
        Ok(())
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Action payload could not be transcribed
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The server dropped the subscription
    #[error("subscription dropped: {0}")]
    Dropped(String),
}

impl From<MessageError> for HeapError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Dropped(_) => HeapError::TransportFailure(err.to_string()),
            other => HeapError::CodecFailure(other.to_string()),
        }
    }
}
