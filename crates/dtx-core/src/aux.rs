//! The auxiliary argument list: ordered, primitive-typed method arguments
//! carried next to a message payload.
//!
//! Each entry on the wire is a 4-byte "empty dictionary key" marker followed
//! by a 4-byte type tag and a type-specific body. Anything that is not a
//! small integer rides as an embedded keyed archive, which is what makes
//! encoding infallible: every value has some representation.

use bytes::{Buf, BufMut};

use dtx_archive::{archive, unarchive, Value};

use crate::DtxError;

/// Entry marker: the serialized form of an empty dictionary key.
const ENTRY_MARKER: u32 = 0x0A;

const TAG_STRING: u32 = 0x01;
const TAG_ARCHIVE: u32 = 0x02;
const TAG_U32: u32 = 0x03;
const TAG_U64: u32 = 0x06;
const TAG_NULL: u32 = 0x0A;

/// One auxiliary argument.
///
/// 64-bit entries share a single wire tag and the wire value is unsigned,
/// so decoding always yields [`AuxValue::U64`]. The signed variant exists
/// for callers that want to send a negative argument.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    Null,
    U32(u32),
    I64(i64),
    U64(u64),
    /// An embedded keyed archive (string and object arguments).
    Archive(Vec<u8>),
}

impl AuxValue {
    /// Archive a value graph into an embedded-object argument.
    pub fn archived(value: &Value) -> AuxValue {
        match archive(value) {
            Ok(bytes) => AuxValue::Archive(bytes),
            Err(e) => {
                // Archiving to a memory buffer does not fail for values the
                // type system admits; an empty archive keeps the entry well
                // formed if it somehow does.
                tracing::error!(error = %e, "failed to archive auxiliary value");
                AuxValue::Archive(Vec::new())
            }
        }
    }

    /// Decode an embedded-object argument back into a value graph.
    pub fn to_value(&self) -> Result<Value, DtxError> {
        match self {
            AuxValue::Null => Ok(Value::Null),
            AuxValue::U32(v) => Ok(Value::I32(*v as i32)),
            AuxValue::I64(v) => Ok(Value::I64(*v)),
            AuxValue::U64(v) => Ok(Value::U64(*v)),
            AuxValue::Archive(bytes) => Ok(unarchive(bytes)?),
        }
    }
}

impl From<i32> for AuxValue {
    fn from(v: i32) -> Self {
        AuxValue::U32(v as u32)
    }
}

impl From<u32> for AuxValue {
    fn from(v: u32) -> Self {
        AuxValue::U32(v)
    }
}

impl From<i64> for AuxValue {
    fn from(v: i64) -> Self {
        AuxValue::I64(v)
    }
}

impl From<u64> for AuxValue {
    fn from(v: u64) -> Self {
        AuxValue::U64(v)
    }
}

impl From<&str> for AuxValue {
    fn from(v: &str) -> Self {
        AuxValue::archived(&Value::String(v.to_string()))
    }
}

impl From<&Value> for AuxValue {
    fn from(v: &Value) -> Self {
        AuxValue::archived(v)
    }
}

/// Encode an argument list into raw entry bytes (no sub-header).
pub fn encode_entries(items: &[AuxValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.put_u32_le(ENTRY_MARKER);
        match item {
            AuxValue::Null => out.put_u32_le(TAG_NULL),
            AuxValue::U32(v) => {
                out.put_u32_le(TAG_U32);
                out.put_u32_le(*v);
            }
            AuxValue::I64(v) => {
                out.put_u32_le(TAG_U64);
                out.put_u64_le(*v as u64);
            }
            AuxValue::U64(v) => {
                out.put_u32_le(TAG_U64);
                out.put_u64_le(*v);
            }
            AuxValue::Archive(bytes) => {
                out.put_u32_le(TAG_ARCHIVE);
                out.put_u32_le(bytes.len() as u32);
                out.put_slice(bytes);
            }
        }
    }
    out
}

/// Decode raw entry bytes into an argument list.
///
/// A truncated or unrecognized entry aborts decoding; everything decoded up
/// to that point is returned.
pub fn decode_entries(mut buf: &[u8]) -> Vec<AuxValue> {
    let mut items = Vec::new();

    while buf.remaining() >= 8 {
        let marker = buf.get_u32_le();
        let tag = buf.get_u32_le();
        if marker != ENTRY_MARKER {
            tracing::warn!(marker, "unexpected auxiliary entry marker, stopping");
            break;
        }

        match tag {
            TAG_NULL => items.push(AuxValue::Null),
            TAG_U32 => {
                if buf.remaining() < 4 {
                    tracing::warn!("truncated u32 auxiliary entry");
                    break;
                }
                items.push(AuxValue::U32(buf.get_u32_le()));
            }
            TAG_U64 => {
                if buf.remaining() < 8 {
                    tracing::warn!("truncated u64 auxiliary entry");
                    break;
                }
                items.push(AuxValue::U64(buf.get_u64_le()));
            }
            TAG_STRING | TAG_ARCHIVE => {
                if buf.remaining() < 4 {
                    tracing::warn!("truncated auxiliary entry length");
                    break;
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    tracing::warn!(len, have = buf.remaining(), "truncated auxiliary entry body");
                    break;
                }
                let body = buf[..len].to_vec();
                buf.advance(len);
                if tag == TAG_STRING {
                    // Reserved inline-string form: normalize to an archive.
                    let s = String::from_utf8_lossy(&body).into_owned();
                    items.push(AuxValue::archived(&Value::String(s)));
                } else {
                    items.push(AuxValue::Archive(body));
                }
            }
            other => {
                tracing::warn!(tag = other, "unknown auxiliary entry tag, stopping");
                break;
            }
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mixed_list() {
        let items = vec![
            AuxValue::U32(5),
            AuxValue::Null,
            AuxValue::U64(0xDEAD_BEEF_u64),
            AuxValue::from("com.apple.instruments.server.services.sysmontap"),
        ];
        let encoded = encode_entries(&items);
        let decoded = decode_entries(&encoded);
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[0], AuxValue::U32(5));
        assert_eq!(decoded[1], AuxValue::Null);
        assert_eq!(decoded[2], AuxValue::U64(0xDEAD_BEEF));
        assert_eq!(
            decoded[3].to_value().unwrap(),
            Value::String("com.apple.instruments.server.services.sysmontap".into())
        );
    }

    #[test]
    fn signed_entries_come_back_unsigned() {
        let encoded = encode_entries(&[AuxValue::I64(-2)]);
        assert_eq!(decode_entries(&encoded), vec![AuxValue::U64(-2i64 as u64)]);
    }

    #[test]
    fn integer_argument_byte_layout() {
        // killPid: with one u64 argument of 42.
        let encoded = encode_entries(&[AuxValue::U64(42)]);
        assert_eq!(
            encoded,
            [
                0x0A, 0x00, 0x00, 0x00, // entry marker
                0x06, 0x00, 0x00, 0x00, // u64 tag
                0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn truncated_entry_keeps_earlier_items() {
        let mut encoded = encode_entries(&[AuxValue::U32(1), AuxValue::U64(2)]);
        encoded.truncate(encoded.len() - 3);
        assert_eq!(decode_entries(&encoded), vec![AuxValue::U32(1)]);
    }

    #[test]
    fn duplicates_are_preserved_in_order() {
        let items = vec![AuxValue::U32(9), AuxValue::U32(9), AuxValue::U32(9)];
        assert_eq!(decode_entries(&encode_entries(&items)), items);
    }
}
