//! Polyester is a replicated key-value collection over a content-addressed
//! store.
//!
//! Core concepts:
//! - **Manifest**: Immutable collection descriptor; its cid is the collection address
//! - **Entry**: A JSON object with an `_id`, stamped with a logical `_clock`
//! - **EntryBlock**: A fixed-size chunk of one writer's entries
//! - **EntryBlockList**: A writer's signed log head, listing its blocks
//! - **Collection**: The envelope exchanged between peers, holding log heads
//! - **CollectionUpdater**: Validates logs, merges them, and materializes the index
//!
//! Every writer owns an append-only log. Peers gossip log heads, and each
//! node rebuilds the same index from the same logs by ordering entries on
//! `(clock, writer)` and applying last-write-wins or first-write-wins.
//!
//! # Example
//!
//! ```
//! use polyester_core::{
//!     CollectionOptions, CollectionUpdater, Ed25519Identity, MemoryStorage, MemoryStore, PublicAccess,
//! };
//! use serde_json::json;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! runtime.block_on(async {
//!     let options = CollectionOptions::default().public_access(PublicAccess::ReadWrite);
//!     let mut notes = CollectionUpdater::new(
//!         options,
//!         MemoryStore::new(),
//!         MemoryStorage::new(),
//!         Ed25519Identity::generate(),
//!     )
//!     .unwrap();
//!
//!     assert!(notes.init("notes").await);
//!     notes.add(vec![json!({"_id": "first", "text": "hello"})]).await;
//!     assert_eq!(notes.index()["first"].get("text"), Some(&json!("hello")));
//! });
//! ```
//!
//! # Canonical encoding
//!
//! Objects are addressed by the blake3 hash of their CBOR encoding. JSON
//! maps are ordered by key, so equal documents always encode to equal bytes.

mod actor;
mod async_store;
mod cid;
mod codec;
mod identity;
mod model;
mod options;
mod resolve;
mod schema;
mod store;
mod updater;
mod validate;

pub use actor::{CollectionHandle, CollectionView, Command, HandleError, run_collection};
pub use async_store::{AsyncStore, ObjectError, get_object, put_object};
pub use cid::{Cid, CidError};
pub use codec::{CodecError, compute_cid};
pub use identity::{CryptoError, Ed25519Identity, Identity, leading_zero_bits};
pub use model::{
    Collection, ConflictResolution, Entry, EntryBlock, EntryBlockList, Manifest, Proof, Provenance, PublicAccess,
};
pub use options::{CollectionOptions, DEFAULT_COMPACT_THRESHOLD, DEFAULT_ENTRY_BLOCK_SIZE, OptionsError};
pub use resolve::{ClockRange, Write};
pub use schema::SchemaError;
pub use store::{LocalStorage, MemoryStorage, MemoryStore, Store};
pub use updater::{CollectionUpdater, MergeOutcome, State, UpdateError, storage_key};
pub use validate::{Severity, ValidationError, Validator, validate_collection, validate_manifest};
