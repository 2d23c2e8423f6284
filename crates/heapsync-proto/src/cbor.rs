//! CBOR field boundary.
//!
//! Fields become CBOR values in layout order: `int32` as an integer,
//! `string` as text, an optional string as text or null, and a nested
//! action list as an array of `[tag, [fields...]]` entries. An update is the
//! array of its fields, so its payload is `[[action...]]`.

use crate::transcription::{read_action, read_update, write_action, write_update, CodecError};
use crate::transcription::{FieldReader, FieldWriter};
use ciborium::Value;
use heapsync_core::{Action, ActionTag, FieldDescriptor, FieldType, FieldValue, Update};

/// Writes fields into a CBOR array.
#[derive(Debug, Default)]
pub struct CborFieldWriter {
    fields: Vec<Value>,
}

impl CborFieldWriter {
    /// Empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The written fields as one array.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Array(self.fields)
    }
}

impl FieldWriter for CborFieldWriter {
    fn write_field(
        &mut self,
        value: &FieldValue,
        descriptor: FieldDescriptor,
        client_side: bool,
    ) -> Result<(), CodecError> {
        let encoded = match (value, descriptor.field_type) {
            (FieldValue::Int32(v), FieldType::Int32) => Value::Integer((*v).into()),
            (FieldValue::String(v), FieldType::String) => Value::Text(v.clone()),
            (FieldValue::OptString(v), FieldType::OptString) => {
                v.clone().map_or(Value::Null, Value::Text)
            }
            (FieldValue::Actions(actions), FieldType::ActionList) => Value::Array(
                actions
                    .iter()
                    .map(|action| action_value(action, client_side))
                    .collect::<Result<_, _>>()?,
            ),
            _ => {
                return Err(CodecError::UnexpectedValue {
                    field: descriptor.name,
                    expected: type_name(descriptor.field_type),
                })
            }
        };
        self.fields.push(encoded);
        Ok(())
    }
}

/// Reads fields from a CBOR array.
#[derive(Debug)]
pub struct CborFieldReader {
    fields: std::vec::IntoIter<Value>,
}

impl CborFieldReader {
    /// Reader over the elements of `value`.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if `value` is not an array.
    pub fn new(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Array(fields) => Ok(Self {
                fields: fields.into_iter(),
            }),
            other => Err(CodecError::Malformed(format!(
                "expected field array, got {other:?}"
            ))),
        }
    }
}

impl FieldReader for CborFieldReader {
    fn read_field(
        &mut self,
        descriptor: FieldDescriptor,
        client_side: bool,
    ) -> Result<Option<FieldValue>, CodecError> {
        let Some(value) = self.fields.next() else {
            return Ok(None);
        };
        let unexpected = || CodecError::UnexpectedValue {
            field: descriptor.name,
            expected: type_name(descriptor.field_type),
        };
        let decoded = match (descriptor.field_type, value) {
            (FieldType::Int32, Value::Integer(v)) => {
                FieldValue::Int32(i32::try_from(v).map_err(|_| unexpected())?)
            }
            (FieldType::String, Value::Text(v)) => FieldValue::String(v),
            (FieldType::OptString, Value::Null) => FieldValue::OptString(None),
            (FieldType::OptString, Value::Text(v)) => FieldValue::OptString(Some(v)),
            (FieldType::ActionList, Value::Array(entries)) => FieldValue::Actions(
                entries
                    .into_iter()
                    .map(|entry| action_from_value(entry, client_side))
                    .collect::<Result<_, _>>()?,
            ),
            _ => return Err(unexpected()),
        };
        Ok(Some(decoded))
    }
}

fn type_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Int32 => "int32",
        FieldType::String => "string",
        FieldType::OptString => "string or null",
        FieldType::ActionList => "action list",
    }
}

/// One action as `[tag, [fields...]]`.
fn action_value(action: &Action, client_side: bool) -> Result<Value, CodecError> {
    let mut writer = CborFieldWriter::new();
    write_action(&mut writer, action, client_side)?;
    Ok(Value::Array(vec![
        Value::Integer((action.tag() as u8).into()),
        writer.into_value(),
    ]))
}

fn action_from_value(entry: Value, client_side: bool) -> Result<Action, CodecError> {
    let Value::Array(parts) = entry else {
        return Err(CodecError::Malformed("action entry is not an array".into()));
    };
    let mut parts = parts.into_iter();
    let tag = match parts.next() {
        Some(Value::Integer(tag)) => u8::try_from(tag)
            .map_err(|_| CodecError::Malformed("action tag out of range".into()))?,
        _ => return Err(CodecError::Malformed("missing action tag".into())),
    };
    let fields = parts.next().unwrap_or(Value::Array(Vec::new()));
    let mut reader = CborFieldReader::new(fields)?;
    read_action(&mut reader, ActionTag::from_u8(tag)?, client_side)
}

/// Encode an update's payload.
///
/// # Errors
///
/// Returns a [`CodecError`] if encoding fails.
pub fn encode_update(update: &Update, client_side: bool) -> Result<Vec<u8>, CodecError> {
    let mut writer = CborFieldWriter::new();
    write_update(&mut writer, update, client_side)?;
    let mut bytes = Vec::new();
    ciborium::into_writer(&writer.into_value(), &mut bytes)
        .map_err(|e| CodecError::Serialize(e.to_string()))?;
    Ok(bytes)
}

/// Decode a payload produced by [`encode_update`].
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed bytes or actions.
pub fn decode_update(bytes: &[u8], client_side: bool) -> Result<Update, CodecError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))?;
    let mut reader = CborFieldReader::new(value)?;
    read_update(&mut reader, client_side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapsync_core::{FieldError, NodeId, NodeKind};

    fn roundtrip(action: Action) {
        let update = Update::new(vec![action]).unwrap();
        let bytes = encode_update(&update, false).unwrap();
        assert_eq!(decode_update(&bytes, true).unwrap(), update);
    }

    #[test]
    fn boundary_values_survive() {
        roundtrip(Action::install_root(NodeId(0), NodeKind::Map));
        roundtrip(Action::install_root(NodeId(u32::MAX), NodeKind::Scalar).with_value(""));
        roundtrip(Action::install_field(NodeId(u32::MAX), NodeId(0), "", NodeKind::List));
        roundtrip(
            Action::install_index(NodeId(1), NodeId(2), u32::MAX, NodeKind::Scalar).with_value("é"),
        );
        roundtrip(Action::remove_field(NodeId(0), NodeId(u32::MAX), "name"));
        roundtrip(Action::remove_children(NodeId(1 << 31)));
        roundtrip(Action::TerminateHeap);
    }

    #[test]
    fn deep_nesting_survives() {
        let mut actions = vec![Action::install_root(NodeId(0), NodeKind::Map)];
        for depth in 1..200u32 {
            actions.push(Action::install_field(
                NodeId(depth - 1),
                NodeId(depth),
                "child",
                NodeKind::Map,
            ));
        }
        let update = Update::new(actions).unwrap();
        let bytes = encode_update(&update, false).unwrap();
        assert_eq!(decode_update(&bytes, true).unwrap(), update);
    }

    #[test]
    fn payload_layout() {
        let update = Update::new(vec![
            Action::install_field(NodeId(0), NodeId(1), "m", NodeKind::Scalar),
            Action::TerminateHeap,
        ])
        .unwrap();
        let mut writer = CborFieldWriter::new();
        write_update(&mut writer, &update, false).unwrap();

        let expected = Value::Array(vec![Value::Array(vec![
            Value::Array(vec![
                Value::Integer(2.into()),
                Value::Array(vec![
                    Value::Integer(0.into()),
                    Value::Integer(1.into()),
                    Value::Text("m".into()),
                    Value::Integer(2.into()),
                    Value::Null,
                ]),
            ]),
            Value::Array(vec![Value::Integer(6.into()), Value::Array(vec![])]),
        ])]);
        assert_eq!(writer.into_value(), expected);
    }

    #[test]
    fn tolerates_older_and_newer_layouts() {
        // Older peer: InstallRoot without the trailing value.
        // Newer peer: RemoveChildren with an extra trailing field.
        let payload = Value::Array(vec![Value::Array(vec![
            Value::Array(vec![
                Value::Integer(1.into()),
                Value::Array(vec![Value::Integer(0.into()), Value::Integer(0.into())]),
            ]),
            Value::Array(vec![
                Value::Integer(5.into()),
                Value::Array(vec![Value::Integer(0.into()), Value::Bool(true)]),
            ]),
        ])]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&payload, &mut bytes).unwrap();

        let update = decode_update(&bytes, true).unwrap();
        assert_eq!(
            update.actions(),
            &[
                Action::install_root(NodeId(0), NodeKind::Map),
                Action::remove_children(NodeId(0)),
            ]
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let entry = |tag: i64, fields: Vec<Value>| {
            Value::Array(vec![Value::Array(vec![Value::Array(vec![
                Value::Integer(tag.into()),
                Value::Array(fields),
            ])])])
        };
        let decode = |value: Value| {
            let mut bytes = Vec::new();
            ciborium::into_writer(&value, &mut bytes).unwrap();
            decode_update(&bytes, true)
        };

        let err = decode(entry(9, vec![])).unwrap_err();
        assert_eq!(err, CodecError::Field(FieldError::UnknownTag(9)));

        let err = decode(entry(5, vec![Value::Text("x".into())])).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedValue { field: "id", .. }));

        let err = decode(entry(1, vec![Value::Integer(0.into()), Value::Integer(3.into())]))
            .unwrap_err();
        assert_eq!(err, CodecError::Field(FieldError::UnknownKind(3)));

        let err = decode(Value::Array(vec![Value::Array(vec![])])).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));

        assert!(matches!(
            decode_update(&[], true),
            Err(CodecError::Deserialize(_))
        ));
    }
}
