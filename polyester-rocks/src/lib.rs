//! RocksDB-backed storage for Polyester.
//!
//! One database holds both the content-addressed objects and the small
//! key-value items a collection keeps locally, in separate column families.

use std::path::Path;

use polyester_core::{Cid, LocalStorage, Store};
use rocksdb::{DB, Options};
use thiserror::Error;

const OBJECTS: &str = "objects";
const ITEMS: &str = "items";

#[derive(Debug, Error)]
pub enum RocksError {
    #[error("RocksDB error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("column family {0} is missing")]
    MissingColumnFamily(&'static str),
    #[error("item is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

/// A persistent store backed by RocksDB.
///
/// Implements both [`Store`] and [`LocalStorage`], so a single handle can
/// back a collection updater.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Opens a RocksDB store at the given path.
    ///
    /// Creates the database and its column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RocksError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, path, [OBJECTS, ITEMS])?;
        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, RocksError> {
        self.db.cf_handle(name).ok_or(RocksError::MissingColumnFamily(name))
    }
}

impl Store for RocksStore {
    type Error = RocksError;

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.db.get_cf(self.cf(OBJECTS)?, cid.as_bytes())?)
    }

    fn put(&self, cid: &Cid, value: &[u8]) -> Result<(), Self::Error> {
        self.db.put_cf(self.cf(OBJECTS)?, cid.as_bytes(), value)?;
        Ok(())
    }

    fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        Ok(self.db.get_pinned_cf(self.cf(OBJECTS)?, cid.as_bytes())?.is_some())
    }
}

impl LocalStorage for RocksStore {
    type Error = RocksError;

    fn get_item(&self, key: &str) -> Result<Option<String>, Self::Error> {
        match self.db.get_cf(self.cf(ITEMS)?, key.as_bytes())? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes)?)),
            None => Ok(None),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        self.db.put_cf(self.cf(ITEMS)?, key.as_bytes(), value.as_bytes())?;
        Ok(())
    }
}
