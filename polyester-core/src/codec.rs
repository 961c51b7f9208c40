//! Canonical CBOR encoding.
//!
//! Everything that is hashed or signed goes through [`to_bytes`]. Struct
//! fields encode in declaration order and `serde_json` maps are sorted, so
//! equal values always produce equal bytes.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Cid;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Serializes a value to canonical CBOR bytes.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Deserializes a value from CBOR bytes.
pub fn from_bytes<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(data).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Computes the content id a value would be stored under.
pub fn compute_cid<T: Serialize + ?Sized>(value: &T) -> Result<Cid, CodecError> {
    Ok(Cid::from_data(&to_bytes(value)?))
}
