//! Acceptance rules for manifests, envelopes and peer logs.
//!
//! Every check is pure: it reads its inputs and returns a verdict. Structural
//! checks from [`crate::schema`] always run before anything is deserialized
//! or verified.

use std::collections::HashMap;

use serde_json::Value;

use crate::codec;
use crate::identity::Identity;
use crate::model::{Collection, ConflictResolution, Entry, EntryBlock, EntryBlockList, Manifest, PublicAccess};
use crate::resolve;
use crate::schema::{self, SchemaError};
use crate::Cid;

/// How a rejection is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Required input is missing or structurally broken.
    Error,
    /// Untrusted input failed a trust or consistency check.
    Warning,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("manifest not found")]
    MissingManifest,
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("collection not found")]
    MissingCollection,
    #[error("invalid collection: {0}")]
    InvalidCollection(String),
    #[error("collection is addressed to {found}, not {expected}")]
    WrongAddress { expected: Cid, found: Cid },
    #[error("empty update from {0}")]
    EmptyUpdate(String),
    #[error("illegal write by {0}")]
    IllegalWrite(String),
    #[error("bad signature on entry block list from {0}")]
    BadSignature(String),
    #[error("entry block {0} not found")]
    MissingBlock(Cid),
    #[error("invalid entry block {cid}: {reason}")]
    InvalidBlock { cid: Cid, reason: String },
    #[error("entry block {cid} holds {len} entries, expected {expected}")]
    WrongBlockSize { cid: Cid, len: usize, expected: String },
    #[error("entry {id} is not owned by writer {writer}")]
    NotOwner { id: String, writer: String },
    #[error("entry {0} has an inadequate proof of work")]
    InadequateProof(String),
    #[error("encrypted entry {0} has no payload")]
    MissingPayload(String),
    #[error("clock {clock} of entry {id} does not increase")]
    NonMonotonicClock { id: String, clock: u64 },
    #[error("declared clock {declared} does not match last entry clock {actual}")]
    IncorrectClock { declared: u64, actual: u64 },
    #[error("writer {0} attempted to rewrite history")]
    HistoryRewrite(String),
}

impl ValidationError {
    pub fn severity(&self) -> Severity {
        match self {
            ValidationError::MissingManifest
            | ValidationError::InvalidManifest(_)
            | ValidationError::MissingCollection
            | ValidationError::InvalidCollection(_)
            | ValidationError::WrongAddress { .. } => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

fn schema_reason(err: SchemaError) -> String {
    err.to_string()
}

/// Checks a fetched manifest document.
pub fn validate_manifest(value: Option<&Value>) -> Result<Manifest, ValidationError> {
    let value = value.ok_or(ValidationError::MissingManifest)?;
    schema::check_manifest(value).map_err(|e| ValidationError::InvalidManifest(schema_reason(e)))?;
    serde_json::from_value(value.clone()).map_err(|e| ValidationError::InvalidManifest(e.to_string()))
}

/// Checks an inbound envelope and that it belongs to `address`.
pub fn validate_collection(value: Option<&Value>, address: &Cid) -> Result<Collection, ValidationError> {
    let value = value
        .filter(|v| !v.is_null())
        .ok_or(ValidationError::MissingCollection)?;
    schema::check_collection(value).map_err(|e| ValidationError::InvalidCollection(schema_reason(e)))?;
    let collection: Collection =
        serde_json::from_value(value.clone()).map_err(|e| ValidationError::InvalidCollection(e.to_string()))?;
    if collection.address != *address {
        return Err(ValidationError::WrongAddress {
            expected: *address,
            found: collection.address,
        });
    }
    Ok(collection)
}

fn encoded_eq(a: &Entry, b: &Entry) -> bool {
    match (codec::to_bytes(a), codec::to_bytes(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Rules that depend on the collection being validated against.
pub struct Validator<'a, I: Identity + ?Sized> {
    pub manifest: &'a Manifest,
    pub address: &'a Cid,
    pub identity: &'a I,
}

impl<'a, I: Identity + ?Sized> Validator<'a, I> {
    pub fn new(manifest: &'a Manifest, address: &'a Cid, identity: &'a I) -> Self {
        Validator {
            manifest,
            address,
            identity,
        }
    }

    /// Checks a writer's log head: non-empty, authorized, correctly signed.
    pub fn entry_block_list(&self, list: &EntryBlockList) -> Result<(), ValidationError> {
        if list.entry_block_cids.is_empty() {
            return Err(ValidationError::EmptyUpdate(list.public_key.clone()));
        }
        if self.manifest.public_access.is_private() && list.public_key != self.manifest.creator_public_key {
            return Err(ValidationError::IllegalWrite(list.public_key.clone()));
        }
        let signed = list
            .signing_bytes()
            .map(|bytes| self.identity.verify(&bytes, &list.signature, &list.public_key))
            .unwrap_or(false);
        if !signed {
            return Err(ValidationError::BadSignature(list.public_key.clone()));
        }
        Ok(())
    }

    /// Checks one fetched block of `writer`'s log.
    pub fn entry_block(
        &self,
        cid: &Cid,
        value: Option<&Value>,
        is_tail: bool,
        writer: &str,
    ) -> Result<EntryBlock, ValidationError> {
        let value = value.ok_or(ValidationError::MissingBlock(*cid))?;
        schema::check_entry_block(value).map_err(|e| ValidationError::InvalidBlock {
            cid: *cid,
            reason: schema_reason(e),
        })?;
        let block: EntryBlock = serde_json::from_value(value.clone()).map_err(|e| ValidationError::InvalidBlock {
            cid: *cid,
            reason: e.to_string(),
        })?;

        let size = self.manifest.entry_block_size as usize;
        let len = block.entries.len();
        if is_tail {
            if len == 0 || len > size {
                return Err(ValidationError::WrongBlockSize {
                    cid: *cid,
                    len,
                    expected: format!("1..={}", size),
                });
            }
        } else if len != size {
            return Err(ValidationError::WrongBlockSize {
                cid: *cid,
                len,
                expected: size.to_string(),
            });
        }

        for entry in &block.entries {
            self.entry(entry, writer)?;
        }
        Ok(block)
    }

    /// Checks a single entry in its public form.
    pub fn entry(&self, entry: &Entry, writer: &str) -> Result<(), ValidationError> {
        match self.manifest.public_access {
            PublicAccess::ReadAnyWriteOwn => {
                if entry.id != writer {
                    return Err(ValidationError::NotOwner {
                        id: entry.id.clone(),
                        writer: writer.to_string(),
                    });
                }
            }
            PublicAccess::None => {
                if !entry.fields.get("payload").is_some_and(Value::is_string) {
                    return Err(ValidationError::MissingPayload(entry.id.clone()));
                }
            }
            PublicAccess::Read | PublicAccess::ReadWrite => {}
        }

        let complexity = self.manifest.complexity;
        if complexity > 0 {
            let proof = entry
                .proof
                .as_ref()
                .ok_or_else(|| ValidationError::InadequateProof(entry.id.clone()))?;
            let verified = entry
                .proof_bytes()
                .map(|bytes| {
                    self.identity.verify_proof(
                        &bytes,
                        &proof.signature,
                        writer,
                        &self.address.to_string(),
                        &proof.nonce,
                        complexity,
                    )
                })
                .unwrap_or(false);
            if !verified {
                return Err(ValidationError::InadequateProof(entry.id.clone()));
            }
        }
        Ok(())
    }

    /// Checks a writer's whole updated chain against its declared clock and
    /// the previously accepted chain.
    ///
    /// Entries up to the previously known maximum clock must resolve to the
    /// same id-to-entry map as before; only later clocks may add anything.
    pub fn entries(
        &self,
        list: &EntryBlockList,
        entries: &[Entry],
        previous: &[Entry],
    ) -> Result<(), ValidationError> {
        let mut last: Option<u64> = None;
        for entry in entries {
            if last.is_some_and(|clock| entry.clock <= clock) {
                return Err(ValidationError::NonMonotonicClock {
                    id: entry.id.clone(),
                    clock: entry.clock,
                });
            }
            last = Some(entry.clock);
        }
        let actual = last.unwrap_or(0);
        if last.is_none() || actual != list.clock {
            return Err(ValidationError::IncorrectClock {
                declared: list.clock,
                actual,
            });
        }

        let Some(previous_max) = previous.iter().map(|e| e.clock).max() else {
            return Ok(());
        };
        let rewrite = || ValidationError::HistoryRewrite(list.public_key.clone());

        let old_by_clock: HashMap<u64, &Entry> = previous.iter().map(|e| (e.clock, e)).collect();
        let known: Vec<Entry> = entries
            .iter()
            .filter(|e| e.clock <= previous_max)
            .cloned()
            .collect();
        for entry in &known {
            if !old_by_clock.get(&entry.clock).is_some_and(|old| encoded_eq(old, entry)) {
                return Err(rewrite());
            }
        }

        let policy = self.manifest.conflict_resolution;
        let before = resolve::resolve(previous.iter().cloned(), policy);
        let after = resolve::resolve(known, policy);
        let unchanged = before.len() == after.len()
            && before
                .iter()
                .all(|(id, old)| after.get(id).is_some_and(|new| encoded_eq(old, new)));
        if !unchanged {
            return Err(rewrite());
        }
        Ok(())
    }
}
