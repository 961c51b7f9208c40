//! Structural checks for untrusted documents.
//!
//! These run on raw JSON values before anything is deserialized or verified:
//! field presence, types and ranges only. Semantic and cryptographic checks
//! live in [`crate::validate`].

use serde_json::{Map, Value};

use crate::Cid;
use crate::model::{ConflictResolution, PublicAccess};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("expected an object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{field}` is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field}[{index}]: {source}")]
    Element {
        field: &'static str,
        index: usize,
        source: Box<SchemaError>,
    },
}

fn object(value: &Value) -> Result<&Map<String, Value>, SchemaError> {
    value.as_object().ok_or(SchemaError::NotAnObject)
}

fn field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, SchemaError> {
    obj.get(name).ok_or(SchemaError::MissingField(name))
}

fn string<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, SchemaError> {
    field(obj, name)?.as_str().ok_or(SchemaError::WrongType {
        field: name,
        expected: "a string",
    })
}

fn uint(obj: &Map<String, Value>, name: &'static str) -> Result<u64, SchemaError> {
    field(obj, name)?.as_u64().ok_or(SchemaError::WrongType {
        field: name,
        expected: "a non-negative integer",
    })
}

fn array<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a Vec<Value>, SchemaError> {
    field(obj, name)?.as_array().ok_or(SchemaError::WrongType {
        field: name,
        expected: "an array",
    })
}

fn one_of(obj: &Map<String, Value>, name: &'static str, allowed: &[&str]) -> Result<(), SchemaError> {
    let value = string(obj, name)?;
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(SchemaError::OutOfRange {
            field: name,
            reason: "unknown variant",
        })
    }
}

fn cid(value: &Value, name: &'static str) -> Result<(), SchemaError> {
    let parsed = value.as_str().map(str::parse::<Cid>);
    match parsed {
        Some(Ok(_)) => Ok(()),
        _ => Err(SchemaError::WrongType {
            field: name,
            expected: "a content id",
        }),
    }
}

fn each<F>(items: &[Value], name: &'static str, check: F) -> Result<(), SchemaError>
where
    F: Fn(&Value) -> Result<(), SchemaError>,
{
    for (index, item) in items.iter().enumerate() {
        check(item).map_err(|source| SchemaError::Element {
            field: name,
            index,
            source: Box::new(source),
        })?;
    }
    Ok(())
}

pub fn check_manifest(value: &Value) -> Result<(), SchemaError> {
    let obj = object(value)?;
    string(obj, "name")?;
    string(obj, "creatorPublicKey")?;
    let access: Vec<&str> = PublicAccess::ALL.iter().map(|a| a.as_str()).collect();
    one_of(obj, "publicAccess", &access)?;
    let size = uint(obj, "entryBlockSize")?;
    if size == 0 || size > u64::from(u32::MAX) {
        return Err(SchemaError::OutOfRange {
            field: "entryBlockSize",
            reason: "must be between 1 and 2^32-1",
        });
    }
    let policies: Vec<&str> = ConflictResolution::ALL.iter().map(|c| c.as_str()).collect();
    one_of(obj, "conflictResolution", &policies)?;
    let complexity = uint(obj, "complexity")?;
    if complexity > 512 {
        return Err(SchemaError::OutOfRange {
            field: "complexity",
            reason: "exceeds the signature length in bits",
        });
    }
    Ok(())
}

pub fn check_entry_block_list(value: &Value) -> Result<(), SchemaError> {
    let obj = object(value)?;
    string(obj, "publicKey")?;
    each(array(obj, "entryBlockCids")?, "entryBlockCids", |v| cid(v, "entryBlockCids"))?;
    uint(obj, "clock")?;
    string(obj, "signature")?;
    Ok(())
}

pub fn check_collection(value: &Value) -> Result<(), SchemaError> {
    let obj = object(value)?;
    string(obj, "senderPublicKey")?;
    cid(field(obj, "address")?, "address")?;
    each(array(obj, "entryBlockLists")?, "entryBlockLists", check_entry_block_list)?;
    uint(obj, "addCount")?;
    Ok(())
}

fn check_proof(value: &Value) -> Result<(), SchemaError> {
    let obj = object(value)?;
    string(obj, "signature")?;
    string(obj, "nonce")?;
    if obj.contains_key("publicKey") {
        string(obj, "publicKey")?;
    }
    Ok(())
}

pub fn check_entry(value: &Value) -> Result<(), SchemaError> {
    let obj = object(value)?;
    string(obj, "_id")?;
    uint(obj, "_clock")?;
    if let Some(proof) = obj.get("_proof") {
        check_proof(proof).map_err(|source| SchemaError::Element {
            field: "_proof",
            index: 0,
            source: Box::new(source),
        })?;
    }
    Ok(())
}

pub fn check_entry_block(value: &Value) -> Result<(), SchemaError> {
    let obj = object(value)?;
    each(array(obj, "entries")?, "entries", check_entry)
}
