use std::future::Future;

use serde::Serialize;
use serde_json::Value;

use crate::codec::{self, CodecError};
use crate::{Cid, Store};

/// Async content-addressed store.
///
/// Mirrors the `Store` trait but with async methods, enabling network-capable
/// implementations (e.g., a block exchange with remote peers). Methods are
/// prefixed with `async_` to avoid name collisions when a type implements
/// both `Store` and `AsyncStore`.
pub trait AsyncStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn async_get(&self, cid: &Cid) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
    fn async_put(&self, cid: &Cid, value: &[u8]) -> impl Future<Output = Result<(), Self::Error>> + Send;
    fn async_has(&self, cid: &Cid) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}

/// Blanket impl: any sync `Store` is also an `AsyncStore`.
impl<S: Store + Send + Sync> AsyncStore for S {
    type Error = S::Error;

    async fn async_get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        self.get(cid)
    }

    async fn async_put(&self, cid: &Cid, value: &[u8]) -> Result<(), Self::Error> {
        self.put(cid, value)
    }

    async fn async_has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        self.has(cid)
    }
}

/// Error from the object helpers.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("store error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Encodes a value canonically, stores it, and returns its cid.
///
/// Storing the same value twice yields the same cid.
pub async fn put_object<S, T>(store: &S, value: &T) -> Result<Cid, ObjectError>
where
    S: AsyncStore,
    T: Serialize + Sync + ?Sized,
{
    let bytes = codec::to_bytes(value)?;
    let cid = Cid::from_data(&bytes);
    if !store
        .async_has(&cid)
        .await
        .map_err(|e| ObjectError::Store(Box::new(e)))?
    {
        store
            .async_put(&cid, &bytes)
            .await
            .map_err(|e| ObjectError::Store(Box::new(e)))?;
    }
    Ok(cid)
}

/// Fetches and decodes the document stored under `cid`.
///
/// Returns `Ok(None)` when the cid is absent, or when the stored bytes do not
/// hash to `cid` (a store serving foreign content is treated as missing it).
pub async fn get_object<S: AsyncStore>(store: &S, cid: &Cid) -> Result<Option<Value>, ObjectError> {
    let Some(bytes) = store
        .async_get(cid)
        .await
        .map_err(|e| ObjectError::Store(Box::new(e)))?
    else {
        return Ok(None);
    };
    if Cid::from_data(&bytes) != *cid {
        log::warn!("object {} failed its integrity check", cid);
        return Ok(None);
    }
    Ok(Some(codec::from_bytes(&bytes)?))
}
