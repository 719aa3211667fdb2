//! Ranged reads against one remote object.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path;

use crate::error::CacheError;

/// Deadline for resolving the object size.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// One immutable object in the remote store.
///
/// The size is resolved once at open time and never refreshed.
#[derive(Clone)]
pub struct RemoteObject {
    store: Arc<dyn ObjectStore>,
    path: Path,
    size: u64,
}

impl RemoteObject {
    pub async fn open(store: Arc<dyn ObjectStore>, key: &str) -> Result<Self, CacheError> {
        if key.is_empty() {
            return Err(CacheError::remote("empty object name"));
        }
        let path = Path::parse(key).map_err(CacheError::remote)?;
        let meta = tokio::time::timeout(HEAD_TIMEOUT, store.head(&path))
            .await
            .map_err(|_| CacheError::remote(format!("timed out resolving size of {path}")))?
            .map_err(CacheError::remote)?;
        Ok(Self {
            store,
            path,
            size: meta.size,
        })
    }

    /// Full size of the remote object.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fetch `len` bytes starting at `offset`.
    ///
    /// Ranges running past the end of the object are clamped. A range
    /// starting past the end is an error.
    pub async fn read(&self, offset: u64, len: u64) -> Result<Bytes, CacheError> {
        if offset > self.size {
            return Err(CacheError::OutOfRange {
                offset,
                size: self.size,
            });
        }
        let end = offset.saturating_add(len).min(self.size);
        if end == offset {
            return Ok(Bytes::new());
        }
        self.store
            .get_range(&self.path, offset..end)
            .await
            .map_err(CacheError::remote)
    }
}
