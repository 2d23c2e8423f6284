//! Action transcription against a field-level wire boundary.
//!
//! An action is written as its descriptor list, field by field, into a
//! [`FieldWriter`]. Its tag travels beside the fields; how it is carried is
//! up to the writer's nested-list encoding. Reading goes the other way, one
//! descriptor at a time, and tolerates peers on older or newer layouts:
//! absent trailing fields read as `None` and extra trailing fields are never
//! asked for.

use heapsync_core::{Action, ActionTag, FieldDescriptor, FieldError, FieldValue, HeapError, Update};

/// Sink for typed fields.
///
/// `client_side` tells the implementation which end of the connection is
/// transcribing, for boundaries whose encoding differs by direction.
pub trait FieldWriter {
    /// Write one field.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the value cannot be encoded.
    fn write_field(
        &mut self,
        value: &FieldValue,
        descriptor: FieldDescriptor,
        client_side: bool,
    ) -> Result<(), CodecError>;
}

/// Source of typed fields.
pub trait FieldReader {
    /// Read the next field, or `None` if the sender's layout ends here.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the next value does not match
    /// `descriptor`.
    fn read_field(
        &mut self,
        descriptor: FieldDescriptor,
        client_side: bool,
    ) -> Result<Option<FieldValue>, CodecError>;
}

/// Transcription errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Field values do not form a valid action
    #[error(transparent)]
    Field(#[from] FieldError),
    /// A value of the wrong shape for its descriptor
    #[error("field {field}: expected {expected}")]
    UnexpectedValue {
        /// Field name
        field: &'static str,
        /// Expected wire shape
        expected: &'static str,
    },
    /// A structurally malformed action entry
    #[error("malformed action: {0}")]
    Malformed(String),
    /// Encoding to bytes failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Decoding from bytes failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

impl From<CodecError> for HeapError {
    fn from(err: CodecError) -> Self {
        HeapError::CodecFailure(err.to_string())
    }
}

/// Write `action`'s fields in layout order.
///
/// # Errors
///
/// Propagates writer failures.
pub fn write_action<W: FieldWriter + ?Sized>(
    writer: &mut W,
    action: &Action,
    client_side: bool,
) -> Result<(), CodecError> {
    for (value, descriptor) in action.field_values().iter().zip(action.descriptors()) {
        writer.write_field(value, *descriptor, client_side)?;
    }
    Ok(())
}

/// Read an action of kind `tag` from its fields.
///
/// # Errors
///
/// Returns a [`CodecError`] if a required field is missing or mistyped.
pub fn read_action<R: FieldReader + ?Sized>(
    reader: &mut R,
    tag: ActionTag,
    client_side: bool,
) -> Result<Action, CodecError> {
    let mut values = Vec::with_capacity(tag.descriptors().len());
    for descriptor in tag.descriptors() {
        match reader.read_field(*descriptor, client_side)? {
            Some(value) => values.push(value),
            None => break,
        }
    }
    Ok(Action::from_fields(tag, values)?)
}

/// Write an update as its single `actions` field.
///
/// # Errors
///
/// Propagates writer failures.
pub fn write_update<W: FieldWriter + ?Sized>(
    writer: &mut W,
    update: &Update,
    client_side: bool,
) -> Result<(), CodecError> {
    let [descriptor] = heapsync_core::action::UPDATE_FIELDS else {
        return Err(CodecError::Malformed("update layout".into()));
    };
    writer.write_field(
        &FieldValue::Actions(update.actions().to_vec()),
        *descriptor,
        client_side,
    )
}

/// Read an update written by [`write_update`].
///
/// # Errors
///
/// Returns a [`CodecError`] if the action list is absent or malformed,
/// or `CodecError::Malformed` for an empty batch.
pub fn read_update<R: FieldReader + ?Sized>(
    reader: &mut R,
    client_side: bool,
) -> Result<Update, CodecError> {
    let [descriptor] = heapsync_core::action::UPDATE_FIELDS else {
        return Err(CodecError::Malformed("update layout".into()));
    };
    match reader.read_field(*descriptor, client_side)? {
        Some(FieldValue::Actions(actions)) => {
            Update::new(actions).map_err(|err| CodecError::Malformed(err.to_string()))
        }
        Some(_) => Err(CodecError::UnexpectedValue {
            field: descriptor.name,
            expected: "action list",
        }),
        None => Err(FieldError::Missing(descriptor.name).into()),
    }
}
