//! Persistent map of fetched chunks.
//!
//! One bit per chunk records whether the chunk is fully present in the
//! local file. Chunks that are being fetched are tracked separately so that
//! every chunk is fetched by at most one task at a time.
//!
//! On disk the map is a 32 byte header followed by the raw bitmap:
//!
//! ```text
//! [0..16)   version tag, "ChunkMapV03" zero padded
//! [16..24)  chunk size in bytes (u64 BE)
//! [24..32)  object size in bytes (u64 BE)
//! [32..)    bitmap, bit i in byte i / 8 under mask 1 << (i % 8)
//! ```

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::CHUNK_SIZE;
use crate::error::CacheError;
use crate::scope::Scope;

/// Version tag written to new files. Change it whenever `CHUNK_SIZE` or the
/// layout changes.
const VERSION_TAG: &[u8] = b"ChunkMapV03";
const VERSION_PREFIX: &[u8] = b"ChunkMapV";
const VERSION_TAG_BYTES: usize = 16;
const HEADER_BYTES: usize = VERSION_TAG_BYTES + 8 + 8;

/// How often unsaved changes are written out.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(9 * 60);

pub struct ChunkMap {
    path: PathBuf,
    size: u64,
    chunk_count: u64,
    state: RwLock<State>,
}

struct State {
    bitmap: Vec<u8>,
    running: HashMap<u64, watch::Sender<()>>,
    modified: Option<Instant>,
    saved: Option<Instant>,
}

/// Outcome of [`ChunkMap::claim`].
pub enum Claim {
    /// The chunk is already present locally.
    Done,
    /// Another task is fetching the chunk.
    Wait(ChunkWaiter),
    /// The caller is now responsible for fetching the chunk.
    Fetch(FetchGuard),
}

/// Handle for waiting on a fetch started by someone else.
pub struct ChunkWaiter {
    rx: watch::Receiver<()>,
}

impl ChunkWaiter {
    /// Resolves when the fetch either completed or was abandoned.
    async fn finished(mut self) {
        // The sender never sends; the channel closes when the fetch ends.
        while self.rx.changed().await.is_ok() {}
    }
}

/// Exclusive right to fetch one chunk.
///
/// Dropping the guard without calling [`FetchGuard::done`] releases the
/// chunk so that waiters give up and a later reader can retry.
pub struct FetchGuard {
    map: Arc<ChunkMap>,
    index: u64,
    completed: bool,
}

impl FetchGuard {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Mark the chunk as present and wake all waiters.
    pub fn done(mut self) {
        self.completed = true;
        self.map.done(self.index);
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.map.state.write().running.remove(&self.index);
        }
    }
}

impl ChunkMap {
    /// Load the map for an object of `size` bytes from `path`.
    ///
    /// A missing or empty file yields an empty map. So does a file written
    /// for another chunk size, object size or format version. A file that
    /// is not a chunk map at all is an error.
    pub async fn load(path: impl Into<PathBuf>, size: u64) -> Result<Self, CacheError> {
        let path = path.into();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Self::decode(path, size, &raw)
    }

    fn empty(path: PathBuf, size: u64) -> Self {
        let chunk_count = size.div_ceil(CHUNK_SIZE);
        Self {
            path,
            size,
            chunk_count,
            state: RwLock::new(State {
                bitmap: vec![0u8; bitmap_len(chunk_count)],
                running: HashMap::new(),
                modified: None,
                saved: None,
            }),
        }
    }

    fn decode(path: PathBuf, size: u64, raw: &[u8]) -> Result<Self, CacheError> {
        if raw.is_empty() {
            return Ok(Self::empty(path, size));
        }
        if raw.len() < HEADER_BYTES {
            let reason = format!("truncated header: {} bytes", raw.len());
            return Err(CacheError::CorruptChunkMap { path, reason });
        }

        let tag = &raw[..VERSION_TAG_BYTES];
        if !tag.starts_with(VERSION_PREFIX) {
            let reason = format!("invalid version tag: {}", String::from_utf8_lossy(tag));
            return Err(CacheError::CorruptChunkMap { path, reason });
        }
        let mut expected_tag = [0u8; VERSION_TAG_BYTES];
        expected_tag[..VERSION_TAG.len()].copy_from_slice(VERSION_TAG);
        if tag != expected_tag {
            warn!(
                path = %path.display(),
                version = %String::from_utf8_lossy(tag).trim_end_matches('\0'),
                "chunk map version incompatible, dropping cache"
            );
            return Ok(Self::empty(path, size));
        }

        let chunk_size = u64::from_be_bytes(raw[16..24].try_into().unwrap());
        let total_size = u64::from_be_bytes(raw[24..32].try_into().unwrap());
        if chunk_size != CHUNK_SIZE || total_size != size {
            warn!(
                path = %path.display(),
                chunk_size,
                total_size,
                "chunk map size validation failed, dropping cache"
            );
            return Ok(Self::empty(path, size));
        }

        let stored = &raw[HEADER_BYTES..];
        let chunk_count = size.div_ceil(CHUNK_SIZE);
        if stored.len() > bitmap_len(chunk_count) {
            let reason = format!(
                "bitmap too large: {} bytes for {} chunks",
                stored.len(),
                chunk_count
            );
            return Err(CacheError::CorruptChunkMap { path, reason });
        }

        let mut map = Self::empty(path, size);
        let state = map.state.get_mut();
        state.bitmap[..stored.len()].copy_from_slice(stored);
        state.saved = Some(Instant::now());
        Ok(map)
    }

    /// Number of chunks covering the object.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Byte range `(offset, length)` of a chunk, clamped to the object size.
    pub fn range(&self, index: u64) -> (u64, u64) {
        let offset = index.saturating_mul(CHUNK_SIZE);
        if offset >= self.size {
            return (self.size, 0);
        }
        (offset, CHUNK_SIZE.min(self.size - offset))
    }

    /// Whether a chunk is present locally.
    ///
    /// Indices past the end of the object are always reported as present.
    pub fn check(&self, index: u64) -> bool {
        if index >= self.chunk_count {
            return true;
        }
        get_bit(&self.state.read().bitmap, index)
    }

    /// Decide who fetches a chunk.
    pub fn claim(self: &Arc<Self>, index: u64) -> Claim {
        if self.check(index) {
            return Claim::Done;
        }
        let mut state = self.state.write();
        if get_bit(&state.bitmap, index) {
            return Claim::Done;
        }
        if let Some(tx) = state.running.get(&index) {
            return Claim::Wait(ChunkWaiter { rx: tx.subscribe() });
        }
        let (tx, _) = watch::channel(());
        state.running.insert(index, tx);
        Claim::Fetch(FetchGuard {
            map: Arc::clone(self),
            index,
            completed: false,
        })
    }

    /// Wait for an in-flight fetch of `index` to finish.
    ///
    /// Returns `FetchAbandoned` if nobody is fetching the chunk or the fetch
    /// ended without marking it done.
    pub async fn wait(&self, scope: &Scope, index: u64) -> Result<(), CacheError> {
        let waiter = {
            let state = self.state.read();
            if index >= self.chunk_count || get_bit(&state.bitmap, index) {
                return Ok(());
            }
            match state.running.get(&index) {
                Some(tx) => ChunkWaiter { rx: tx.subscribe() },
                None => return Err(CacheError::FetchAbandoned { index }),
            }
        };
        tokio::select! {
            _ = scope.cancelled() => return Err(CacheError::cancelled(scope)),
            _ = waiter.finished() => {}
        }
        if self.check(index) {
            Ok(())
        } else {
            Err(CacheError::FetchAbandoned { index })
        }
    }

    /// Wait on a handle obtained from [`ChunkMap::claim`].
    pub(crate) async fn wait_for(
        &self,
        scope: &Scope,
        index: u64,
        waiter: ChunkWaiter,
    ) -> Result<(), CacheError> {
        tokio::select! {
            _ = scope.cancelled() => return Err(CacheError::cancelled(scope)),
            _ = waiter.finished() => {}
        }
        if self.check(index) {
            Ok(())
        } else {
            Err(CacheError::FetchAbandoned { index })
        }
    }

    /// Mark a chunk as present and release everyone waiting for it.
    pub fn done(&self, index: u64) {
        if index >= self.chunk_count {
            return;
        }
        let mut state = self.state.write();
        set_bit(&mut state.bitmap, index);
        // Dropping the sender closes the channel and wakes waiters.
        state.running.remove(&index);
        state.modified = Some(Instant::now());
    }

    /// Number of chunks present locally.
    pub fn cached(&self) -> u64 {
        self.state
            .read()
            .bitmap
            .iter()
            .map(|b| u64::from(b.count_ones()))
            .sum()
    }

    /// First chunk at or after `start` that is not present locally.
    pub fn next_missing(&self, start: u64) -> Option<u64> {
        let state = self.state.read();
        (start..self.chunk_count).find(|&i| !get_bit(&state.bitmap, i))
    }

    /// Write the map to disk atomically.
    pub async fn save(self: &Arc<Self>) -> Result<(), CacheError> {
        let map = Arc::clone(self);
        tokio::task::spawn_blocking(move || map.save_blocking())
            .await
            .map_err(CacheError::task)?
    }

    fn save_blocking(&self) -> Result<(), CacheError> {
        let (bitmap, snapshot_at) = {
            let state = self.state.read();
            (state.bitmap.clone(), Instant::now())
        };
        self.write_file(&bitmap)?;
        self.state.write().saved = Some(snapshot_at);
        debug!(path = %self.path.display(), "chunk map saved");
        Ok(())
    }

    fn write_file(&self, bitmap: &[u8]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let prefix = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let mut header = [0u8; HEADER_BYTES];
        header[..VERSION_TAG.len()].copy_from_slice(VERSION_TAG);
        header[16..24].copy_from_slice(&CHUNK_SIZE.to_be_bytes());
        header[24..32].copy_from_slice(&self.size.to_be_bytes());

        let mut temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp.write_all(&header)?;
        temp.write_all(bitmap)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Save periodically until `scope` is cancelled.
    pub async fn autosave(self: Arc<Self>, scope: Scope) {
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(AUTOSAVE_INTERVAL / 2) => {}
            }
            let (modified, saved) = {
                let state = self.state.read();
                (state.modified, state.saved)
            };
            if !autosave_due(modified, saved, Instant::now(), AUTOSAVE_INTERVAL) {
                continue;
            }
            if let Err(e) = self.save().await {
                warn!(path = %self.path.display(), error = %e, "chunk map autosave failed");
            }
        }
    }
}

/// Whether unsaved changes should be written now.
///
/// Saves once changes have settled for a quarter of `interval`, or when
/// changes have been accumulating for a full `interval` without a save.
pub(crate) fn autosave_due(
    modified: Option<Instant>,
    saved: Option<Instant>,
    now: Instant,
    interval: Duration,
) -> bool {
    let Some(modified) = modified else {
        return false;
    };
    let Some(saved) = saved else {
        return true;
    };
    if saved >= modified {
        return false;
    }
    let settled = now.saturating_duration_since(modified) >= interval / 4;
    let overdue = modified.duration_since(saved) >= interval;
    settled || overdue
}

fn bitmap_len(chunk_count: u64) -> usize {
    chunk_count.div_ceil(8) as usize
}

fn get_bit(bitmap: &[u8], index: u64) -> bool {
    bitmap
        .get((index / 8) as usize)
        .is_some_and(|b| b & (1 << (index % 8)) != 0)
}

fn set_bit(bitmap: &mut [u8], index: u64) {
    if let Some(b) = bitmap.get_mut((index / 8) as usize) {
        *b |= 1 << (index % 8);
    }
}
