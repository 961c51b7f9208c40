//! Wire types shared by peers.
//!
//! Every type here is stored in the content store or published to peers, so
//! field names follow the camelCase wire format and field order is part of
//! the canonical encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Cid;
use crate::codec::{self, CodecError};

/// Who may read and write a collection besides its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PublicAccess {
    /// Creator only; entries are encrypted.
    None,
    /// Anyone reads, creator writes.
    #[default]
    Read,
    /// Anyone reads and writes.
    ReadWrite,
    /// Anyone reads; anyone writes the single entry keyed by their public key.
    ReadAnyWriteOwn,
}

impl PublicAccess {
    pub const ALL: [PublicAccess; 4] = [
        PublicAccess::None,
        PublicAccess::Read,
        PublicAccess::ReadWrite,
        PublicAccess::ReadAnyWriteOwn,
    ];

    /// Only the creator may write.
    pub fn is_private(self) -> bool {
        match self {
            PublicAccess::None | PublicAccess::Read => true,
            PublicAccess::ReadWrite | PublicAccess::ReadAnyWriteOwn => false,
        }
    }

    /// Entries are stored encrypted.
    pub fn is_encrypted(self) -> bool {
        matches!(self, PublicAccess::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PublicAccess::None => "None",
            PublicAccess::Read => "Read",
            PublicAccess::ReadWrite => "ReadWrite",
            PublicAccess::ReadAnyWriteOwn => "ReadAnyWriteOwn",
        }
    }
}

/// Policy for concurrent writes to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConflictResolution {
    #[default]
    LastWriteWins,
    FirstWriteWins,
}

impl ConflictResolution {
    pub const ALL: [ConflictResolution; 2] =
        [ConflictResolution::LastWriteWins, ConflictResolution::FirstWriteWins];

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::LastWriteWins => "LastWriteWins",
            ConflictResolution::FirstWriteWins => "FirstWriteWins",
        }
    }
}

/// Immutable collection configuration. Its cid is the collection address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub creator_public_key: String,
    pub public_access: PublicAccess,
    pub entry_block_size: u32,
    pub conflict_resolution: ConflictResolution,
    pub complexity: u32,
}

/// Signature attached to an entry, optionally carrying a proof of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub signature: String,
    pub nonce: String,
    /// Signer key, embedded in portable proofs that are not tied to a
    /// collection address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// The writer an indexed entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub public_key: String,
}

/// A user object with its bookkeeping fields.
///
/// Everything that is not a bookkeeping field lands in `fields`, which is the
/// payload that gets encrypted in private collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_clock", default)]
    pub clock: u64,
    #[serde(rename = "_proof", default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
    #[serde(rename = "_identity", default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Provenance>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entry {
    pub fn new(id: impl Into<String>) -> Self {
        Entry {
            id: id.into(),
            clock: 0,
            proof: None,
            identity: None,
            fields: Map::new(),
        }
    }

    /// Adds a user field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Bytes covered by the entry's proof: the entry without `_proof` and
    /// `_identity`.
    pub fn proof_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let bare = Entry {
            proof: None,
            identity: None,
            ..self.clone()
        };
        codec::to_bytes(&bare)
    }

    /// Converts the entry to a JSON object.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("_id".into(), Value::String(self.id.clone()));
        object.insert("_clock".into(), Value::from(self.clock));
        if let Some(proof) = &self.proof {
            object.insert(
                "_proof".into(),
                serde_json::to_value(proof).unwrap_or(Value::Null),
            );
        }
        if let Some(identity) = &self.identity {
            object.insert("_identity".into(), serde_json::json!({"publicKey": identity.public_key}));
        }
        Value::Object(object)
    }
}

/// A content-addressed batch of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntryBlock {
    pub entries: Vec<Entry>,
}

/// Signed head of one writer's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryBlockList {
    pub public_key: String,
    pub entry_block_cids: Vec<Cid>,
    pub clock: u64,
    pub signature: String,
}

impl EntryBlockList {
    pub fn unsigned(public_key: impl Into<String>, entry_block_cids: Vec<Cid>, clock: u64) -> Self {
        EntryBlockList {
            public_key: public_key.into(),
            entry_block_cids,
            clock,
            signature: String::new(),
        }
    }

    /// Bytes covered by the signature: the list with `signature` cleared.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let unsigned = EntryBlockList {
            signature: String::new(),
            ..self.clone()
        };
        codec::to_bytes(&unsigned)
    }
}

/// Envelope exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub sender_public_key: String,
    pub address: Cid,
    pub entry_block_lists: Vec<EntryBlockList>,
    pub add_count: u64,
}
