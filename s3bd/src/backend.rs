//! Byte-range read capability bound to an export.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::ObjectCache;
use crate::error::CacheError;

/// Random-access reads.
///
/// `read_at` fills as much of `buf` as it can and returns the number of
/// bytes read. A failure after a partial fill is reported as a short
/// `Ok(n)` and surfaces on the next call. Implementations never return
/// `Ok(0)` for a non-empty buffer; running out of data is an error.
#[async_trait]
pub trait ReadAt: Send + Sync {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError>;
}

/// What a negotiated export is served from.
#[derive(Clone)]
pub enum Backend {
    /// A cache owned by one connection and closed when it ends.
    Cache(Arc<ObjectCache>),
    /// A cache shared between connections. Only its owner closes it.
    Shared(Arc<ObjectCache>),
    /// A fixed in-memory image.
    Memory(Bytes),
}

impl Backend {
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        match self {
            Self::Cache(cache) | Self::Shared(cache) => cache.read_at(buf, offset).await,
            Self::Memory(data) => read_memory(data, buf, offset),
        }
    }

    /// Export size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Cache(cache) | Self::Shared(cache) => cache.size(),
            Self::Memory(data) => data.len() as u64,
        }
    }

    /// Release the backend at the end of a connection.
    ///
    /// Only connection-owned caches are closed; shared caches and memory
    /// images are left alone.
    pub async fn close(&self) -> Result<(), CacheError> {
        match self {
            Self::Cache(cache) => cache.close().await,
            Self::Shared(_) | Self::Memory(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ReadAt for Backend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        Backend::read_at(self, buf, offset).await
    }
}

fn read_memory(data: &Bytes, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
    if buf.is_empty() {
        return Ok(0);
    }
    let size = data.len() as u64;
    if offset >= size {
        return Err(CacheError::OutOfRange { offset, size });
    }
    let start = offset as usize;
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}
