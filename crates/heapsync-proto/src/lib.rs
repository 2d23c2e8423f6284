//! # heapsync protocol
//!
//! Wire format and MQTT topic scheme for heap subscriptions.
//!
//! ## Transcription
//!
//! Actions are written field by field against a [`FieldWriter`] and read
//! back through a [`FieldReader`]. The CBOR boundary encodes each action as
//! `[tag, [fields...]]`.
//!
//! ## Messages
//!
//! - `SubscribeRequest` / `UnsubscribeRequest`: control messages from clients
//! - `UpdateFrame`: one sequenced delivery to a subscriber
//!
//! ## MQTT Topics
//!
//! Topic scheme: `heapsync/v1/{tenant}/{heap_id}/{message_type}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cbor;
pub mod messages;
pub mod topics;
pub mod transcription;

pub use cbor::{decode_update, encode_update, CborFieldReader, CborFieldWriter};
pub use messages::{
    FrameKind, MessageError, SequenceTracker, SubscribeRequest, UnsubscribeRequest, UpdateFrame,
};
pub use topics::{parse_broker_url, BrokerUrlError, MessageType, TopicScheme};
pub use transcription::{
    read_action, read_update, write_action, write_update, CodecError, FieldReader, FieldWriter,
};
