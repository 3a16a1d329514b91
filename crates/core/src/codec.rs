//! Value serialization.
//!
//! Matrices store opaque bytes. A zero-length byte sequence is reserved for
//! tombstones, so a codec must never encode a real value as empty bytes.

use serde_json::Value;

use crate::error::{Result, VersoError};

pub trait ValueCodec: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON encoding via `serde_json`. The default codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode an entry for a matrix: `None` becomes the empty tombstone.
pub(crate) fn encode_entry(codec: &dyn ValueCodec, value: Option<&Value>) -> Result<Vec<u8>> {
    match value {
        None => Ok(Vec::new()),
        Some(v) => {
            let bytes = codec.serialize(v)?;
            if bytes.is_empty() {
                return Err(VersoError::Internal(
                    "codec produced an empty encoding for a non-tombstone value".into(),
                ));
            }
            Ok(bytes)
        }
    }
}

pub(crate) fn decode_entry(codec: &dyn ValueCodec, bytes: &[u8]) -> Result<Option<Value>> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        codec.deserialize(bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_bytes_decode_as_tombstone() {
        assert_eq!(decode_entry(&JsonCodec, &[]).unwrap(), None);
        assert!(encode_entry(&JsonCodec, None).unwrap().is_empty());
    }

    #[test]
    fn json_values_survive_encoding() {
        let value = json!({"name": "alice", "tags": [1, 2, 3]});
        let bytes = encode_entry(&JsonCodec, Some(&value)).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(decode_entry(&JsonCodec, &bytes).unwrap(), Some(value));
    }

    #[test]
    fn codec_emitting_empty_bytes_is_rejected() {
        struct Broken;
        impl ValueCodec for Broken {
            fn serialize(&self, _: &Value) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn deserialize(&self, _: &[u8]) -> Result<Value> {
                Ok(Value::Null)
            }
        }
        let err = encode_entry(&Broken, Some(&Value::Null)).unwrap_err();
        assert!(matches!(err, VersoError::Internal(_)));
    }
}
