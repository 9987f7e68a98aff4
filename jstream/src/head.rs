//! Wire head records.
//!
//! Every element starts with one JSON object announcing its kind. Readers
//! skip ASCII whitespace between head records and ignore unrecognized fields
//! for forward compatibility; writers emit heads back to back with no
//! separator, since a separator after a `bytesStart` head would be read as
//! part of the blob body.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// A decoded head record, with every recognized field optional.
///
/// Classification by field presence happens in the reader; a record carrying
/// several of these fields is resolved by a fixed priority there.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct Head {
    /// Raw payload of a value element. Present even when the JSON content is
    /// the literal `null`, which serde's `Option` handling would otherwise
    /// fold into absence.
    #[serde(deserialize_with = "raw_even_if_null")]
    pub val: Option<Box<RawValue>>,
    /// Marks the start of a byte blob body.
    pub bytes_start: Option<bool>,
    /// Marks the start of a nested stream.
    pub stream_start: Option<bool>,
    /// Tail record: the enclosing stream ended normally.
    pub stream_end: Option<bool>,
    /// Tail record: the enclosing stream was canceled.
    pub stream_cancel: Option<bool>,
    /// Advisory size estimate: blob byte length or stream element count.
    pub size_hint: Option<u64>,
}

/// Captures a present field as raw JSON even when its content is `null`.
fn raw_even_if_null<'de, D>(de: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(de).map(Some)
}

/// Serialized head of a value element: `{"val": <payload>}`.
#[derive(Debug, Serialize)]
pub(crate) struct ValueHead<'a, T> {
    /// The caller's payload, serialized in place.
    pub val: &'a T,
}

/// Serialized head of a byte blob: `{"bytesStart":true,"sizeHint":n}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BytesHead {
    /// Always `true`.
    pub bytes_start: bool,
    /// Advisory blob length estimate, omitted when unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

/// Serialized head of a nested stream: `{"streamStart":true,"sizeHint":n}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StreamHead {
    /// Always `true`.
    pub stream_start: bool,
    /// Advisory element count estimate, omitted when unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

/// Serialized tail record ending a stream normally.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StreamEndTail {
    /// Always `true`.
    pub stream_end: bool,
}

/// Serialized tail record canceling a stream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StreamCancelTail {
    /// Always `true`.
    pub stream_cancel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_val_is_present() {
        let head: Head = serde_json::from_str(r#"{"val":null}"#).unwrap();
        assert_eq!(head.val.unwrap().get(), "null");
    }

    #[test]
    fn absent_val_is_none() {
        let head: Head = serde_json::from_str(r#"{"streamStart":true}"#).unwrap();
        assert!(head.val.is_none());
        assert_eq!(head.stream_start, Some(true));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let head: Head =
            serde_json::from_str(r#"{"val":3,"futureField":"x","other":[1,2]}"#).unwrap();
        assert_eq!(head.val.unwrap().get(), "3");
    }

    #[test]
    fn heads_serialize_without_absent_hints() {
        let head = BytesHead {
            bytes_start: true,
            size_hint: None,
        };
        assert_eq!(
            serde_json::to_string(&head).unwrap(),
            r#"{"bytesStart":true}"#
        );

        let head = StreamHead {
            stream_start: true,
            size_hint: Some(7),
        };
        assert_eq!(
            serde_json::to_string(&head).unwrap(),
            r#"{"streamStart":true,"sizeHint":7}"#
        );
    }
}
