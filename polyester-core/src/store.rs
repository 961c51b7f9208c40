use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use crate::Cid;

/// A content-addressed store for encoded objects.
///
/// Stores operate on raw bytes; hashing and encoding are handled by the
/// object helpers in [`crate::async_store`]. Content is immutable once
/// written, so re-storing identical bytes under the same cid is a no-op.
///
/// All methods take `&self` to support stores with internal locking (e.g., RocksDB).
pub trait Store {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Retrieves the bytes stored under a cid, or None if not present.
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Stores bytes under the given cid.
    fn put(&self, cid: &Cid, value: &[u8]) -> Result<(), Self::Error>;

    /// Checks whether a cid exists in the store.
    fn has(&self, cid: &Cid) -> Result<bool, Self::Error>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    type Error = S::Error;

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        (**self).get(cid)
    }

    fn put(&self, cid: &Cid, value: &[u8]) -> Result<(), Self::Error> {
        (**self).put(cid, value)
    }

    fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        (**self).has(cid)
    }
}

/// An in-memory store backed by a HashMap.
///
/// Useful for testing and as a reference implementation. Share one behind an
/// `Arc` to give several peers the same view of the content network.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    type Error = Infallible;

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.data.read().unwrap().get(cid).cloned())
    }

    fn put(&self, cid: &Cid, value: &[u8]) -> Result<(), Self::Error> {
        self.data.write().unwrap().insert(*cid, value.to_vec());
        Ok(())
    }

    fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        Ok(self.data.read().unwrap().contains_key(cid))
    }
}

/// Persistent local key-value storage, private to one node.
///
/// The updater keeps a single item per collection: the cid of its latest
/// snapshot, under `"/db/" + address`.
pub trait LocalStorage: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get_item(&self, key: &str) -> Result<Option<String>, Self::Error>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), Self::Error>;
}

impl<L: LocalStorage + ?Sized> LocalStorage for Arc<L> {
    type Error = L::Error;

    fn get_item(&self, key: &str) -> Result<Option<String>, Self::Error> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        (**self).set_item(key, value)
    }
}

/// In-memory [`LocalStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    type Error = Infallible;

    fn get_item(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.items.read().unwrap().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        self.items
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
