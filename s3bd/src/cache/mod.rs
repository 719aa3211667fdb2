//! Read-through local cache for immutable remote objects.
//!
//! An [`ObjectCache`] serves reads of one remote object out of a sparse
//! local copy. The object is split into fixed-size chunks; a chunk is
//! fetched from the remote store the first time a read needs it and is
//! served locally from then on.
//!
//! # Architecture
//!
//! - [`RemoteObject`] performs ranged GETs against the object store
//! - [`LocalFile`] holds the cached bytes, preallocated to the object size
//! - [`ChunkMap`] records fetched chunks and coordinates in-flight fetches
//! - [`PriorityQueue`] bounds concurrent fetches, per object and globally
//!
//! Every background task (chunk map autosave, warm-up, fetches) runs on the
//! cache's task tracker under the cache scope, so `close` can wait for all
//! of them.

mod chunk_map;
mod local;
mod queue;
mod remote;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use object_store::ObjectStore;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use chunk_map::{AUTOSAVE_INTERVAL, ChunkMap, ChunkWaiter, Claim, FetchGuard};
pub use local::LocalFile;
pub use queue::{CONN_LIMIT_GLOBAL, CONN_LIMIT_PER_OBJECT, PriorityQueue};
pub use remote::RemoteObject;

use crate::error::CacheError;
use crate::scope::{Cause, Scope};

/// Size of one chunk (1 MiB), the unit of fetching and bookkeeping.
pub const CHUNK_SIZE: u64 = 1 << 20;

/// How long `close` waits for background tasks before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Warm-up pauses while foreground misses happened more recently than this.
pub const IDLE_DELAY: Duration = Duration::from_secs(60);

/// Attempts per chunk before warm-up skips it.
const WARM_UP_RETRIES: u32 = 5;

/// Attempts to obtain a chunk when concurrent fetches keep failing.
const FETCH_ATTEMPTS: u32 = 3;

/// Options for opening an [`ObjectCache`].
#[derive(Clone)]
pub struct CacheOptions {
    /// Fetch the whole object in the background while the cache is idle.
    pub prefetch: bool,
    /// Idle time required before each background fetch.
    pub idle_delay: Duration,
    /// Admission shared with other caches. A private one is created if unset.
    pub global_queue: Option<Arc<PriorityQueue>>,
    /// Scope the cache scope is derived from.
    pub parent_scope: Option<Scope>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            prefetch: true,
            idle_delay: IDLE_DELAY,
            global_queue: None,
            parent_scope: None,
        }
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Chunks that were already local when a read needed them.
    pub hits: u64,
    /// Chunks a read had to wait for.
    pub misses: u64,
    /// Chunks fetched from the remote store since open.
    pub fetched_chunks: u64,
    /// Bytes fetched from the remote store since open.
    pub fetched_bytes: u64,
    /// Chunks present locally.
    pub cached_chunks: u64,
    /// Chunks covering the whole object.
    pub total_chunks: u64,
}

/// Local cache of one remote object.
pub struct ObjectCache {
    inner: Arc<Inner>,
}

struct Inner {
    key: String,
    remote: RemoteObject,
    local: LocalFile,
    chunks: Arc<ChunkMap>,
    queue: PriorityQueue,
    global: Arc<PriorityQueue>,
    scope: Scope,
    tasks: TaskTracker,
    closed: AtomicBool,
    last_miss: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetched_chunks: AtomicU64,
    fetched_bytes: AtomicU64,
}

enum Pending {
    Ready,
    Waiting(ChunkWaiter),
    Fetching(JoinHandle<Result<(), CacheError>>),
}

impl ObjectCache {
    /// Open the cache for object `key`, keeping local state under `local_dir`.
    ///
    /// The cached bytes live in `<local_dir>/<key>` and the chunk map next to
    /// them in `<local_dir>/<key>.chunk`.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        key: &str,
        local_dir: &Path,
        options: CacheOptions,
    ) -> Result<Self, CacheError> {
        let remote = RemoteObject::open(store, key).await?;
        let size = remote.size();

        let data_path = local_dir.join(key);
        let local = LocalFile::open(&data_path, size).await?;
        let chunks = Arc::new(ChunkMap::load(chunk_map_path(&data_path), size).await?);

        let scope = match &options.parent_scope {
            Some(parent) => parent.child(),
            None => Scope::root(),
        };
        let global = options
            .global_queue
            .clone()
            .unwrap_or_else(|| Arc::new(PriorityQueue::new(CONN_LIMIT_GLOBAL)));

        let inner = Arc::new(Inner {
            key: key.to_string(),
            remote,
            local,
            chunks: Arc::clone(&chunks),
            queue: PriorityQueue::new(CONN_LIMIT_PER_OBJECT),
            global,
            scope: scope.clone(),
            tasks: TaskTracker::new(),
            closed: AtomicBool::new(false),
            last_miss: Mutex::new(Instant::now()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetched_chunks: AtomicU64::new(0),
            fetched_bytes: AtomicU64::new(0),
        });

        inner.tasks.spawn(chunks.autosave(scope));
        if options.prefetch {
            inner
                .tasks
                .spawn(Arc::clone(&inner).warm_up(options.idle_delay));
        }

        info!(
            key,
            size_bytes = size,
            cached_chunks = inner.chunks.cached(),
            total_chunks = inner.chunks.chunk_count(),
            "cache opened"
        );
        Ok(Self { inner })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Size of the cached object in bytes.
    pub fn size(&self) -> u64 {
        self.inner.remote.size()
    }

    /// Read into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` at
    /// the end of the object or when a later chunk fails after earlier ones
    /// were read. The failure is then reported by the next call.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        self.inner.read_at(buf, offset).await
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            fetched_chunks: inner.fetched_chunks.load(Ordering::Relaxed),
            fetched_bytes: inner.fetched_bytes.load(Ordering::Relaxed),
            cached_chunks: inner.chunks.cached(),
            total_chunks: inner.chunks.chunk_count(),
        }
    }

    /// Stop background work and persist the chunk map.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if background tasks are still running `CLOSE_TIMEOUT` after
    /// the cache scope was cancelled.
    pub async fn close(&self) -> Result<(), CacheError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.scope.cancel(Cause::CacheClosed);
        inner.tasks.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, inner.tasks.wait())
            .await
            .is_err()
        {
            panic!(
                "orphaned tasks left behind after closing cache {}",
                inner.key
            );
        }

        let saved = inner.chunks.save().await;
        let synced = inner.local.sync().await;
        info!(key = %inner.key, "cache closed");
        saved.and(synced)
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        self.inner.scope.cancel(Cause::CacheClosed);
    }
}

impl Inner {
    async fn read_at(self: &Arc<Self>, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        let size = self.remote.size();
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= size {
            return Err(CacheError::OutOfRange { offset, size });
        }
        let end = offset.saturating_add(buf.len() as u64).min(size);

        // Start every missing chunk before waiting on the first one.
        let first = offset / CHUNK_SIZE;
        let last = (end - 1) / CHUNK_SIZE;
        let pending: Vec<(u64, Pending)> = (first..=last)
            .map(|index| (index, self.start(index, false)))
            .collect();

        let mut filled = 0usize;
        let mut pos = offset;
        for (index, pending) in pending {
            let chunk_end = ((index + 1) * CHUNK_SIZE).min(end);
            let result = match self.ensure(index, pending, false).await {
                Ok(()) => self.local.read_at(pos, (chunk_end - pos) as usize).await,
                Err(e) => Err(e),
            };
            let data = match result {
                Ok(data) => data,
                Err(e) if filled == 0 => return Err(e),
                Err(e) => {
                    debug!(key = %self.key, chunk = index, error = %e, "partial read");
                    break;
                }
            };
            buf[filled..filled + data.len()].copy_from_slice(&data);
            filled += data.len();
            pos += data.len() as u64;
            if pos < chunk_end {
                break;
            }
        }
        Ok(filled)
    }

    /// Claim a chunk, spawning its fetch if nobody else is on it.
    fn start(self: &Arc<Self>, index: u64, background: bool) -> Pending {
        let claim = self.chunks.claim(index);
        if !background {
            if matches!(claim, Claim::Done) {
                self.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                *self.last_miss.lock() = Instant::now();
            }
        }
        match claim {
            Claim::Done => Pending::Ready,
            Claim::Wait(waiter) => Pending::Waiting(waiter),
            // The fetch outlives the reader so the chunk still lands in the
            // cache if the reader goes away.
            Claim::Fetch(guard) => {
                Pending::Fetching(self.tasks.spawn(Arc::clone(self).fetch(guard, background)))
            }
        }
    }

    /// Wait until a chunk is local.
    async fn ensure(
        self: &Arc<Self>,
        index: u64,
        mut pending: Pending,
        background: bool,
    ) -> Result<(), CacheError> {
        for _ in 0..FETCH_ATTEMPTS {
            let result = match pending {
                Pending::Ready => return Ok(()),
                Pending::Waiting(waiter) => self.chunks.wait_for(&self.scope, index, waiter).await,
                Pending::Fetching(handle) => return handle.await.map_err(CacheError::task)?,
            };
            match result {
                Err(CacheError::FetchAbandoned { .. }) => pending = self.start(index, background),
                other => return other,
            }
        }
        Err(CacheError::FetchAbandoned { index })
    }

    async fn fetch(self: Arc<Self>, guard: FetchGuard, background: bool) -> Result<(), CacheError> {
        let index = guard.index();
        self.admit(background).await?;
        let result = tokio::select! {
            _ = self.scope.cancelled() => Err(CacheError::cancelled(&self.scope)),
            r = self.transfer(index) => r,
        };
        self.dismiss().await;

        let bytes = result?;
        guard.done();
        self.fetched_chunks.fetch_add(1, Ordering::Relaxed);
        self.fetched_bytes.fetch_add(bytes, Ordering::Relaxed);
        debug!(key = %self.key, chunk = index, bytes, background, "chunk fetched");
        Ok(())
    }

    /// Copy one chunk from the remote object into the local file.
    async fn transfer(&self, index: u64) -> Result<u64, CacheError> {
        let (offset, len) = self.chunks.range(index);
        let data = self.remote.read(offset, len).await?;
        if data.len() as u64 != len {
            return Err(CacheError::ShortFetch {
                index,
                actual_bytes: data.len() as u64,
                expected_bytes: len,
            });
        }
        self.local.write_at(offset, data).await?;
        Ok(len)
    }

    /// Take a slot in the per-object queue, then in the global one.
    async fn admit(&self, background: bool) -> Result<(), CacheError> {
        if background {
            self.queue.acquire_low_priority(&self.scope).await?;
        } else {
            self.queue.acquire(&self.scope).await?;
        }
        let global = if background {
            self.global.acquire_low_priority(&self.scope).await
        } else {
            self.global.acquire(&self.scope).await
        };
        if let Err(e) = global {
            self.queue.release().await;
            return Err(e);
        }
        Ok(())
    }

    async fn dismiss(&self) {
        self.global.release().await;
        self.queue.release().await;
    }

    /// Fetch every missing chunk while foreground reads are idle.
    async fn warm_up(self: Arc<Self>, idle_delay: Duration) {
        let mut index = 0;
        let mut retries = 0;
        loop {
            loop {
                let idle = self.last_miss.lock().elapsed();
                if idle >= idle_delay {
                    break;
                }
                tokio::select! {
                    _ = self.scope.cancelled() => return,
                    _ = tokio::time::sleep(idle_delay - idle) => {}
                }
            }
            if self.scope.is_cancelled() {
                return;
            }
            let Some(next) = self.chunks.next_missing(index) else {
                info!(key = %self.key, "cache warm-up complete");
                return;
            };
            index = next;

            let pending = self.start(index, true);
            match self.ensure(index, pending, true).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return,
                Err(e) if retries < WARM_UP_RETRIES => {
                    retries += 1;
                    debug!(key = %self.key, chunk = index, retries, error = %e, "background fetch failed, retrying");
                    continue;
                }
                Err(e) => {
                    warn!(key = %self.key, chunk = index, error = %e, "background fetch failed");
                }
            }
            retries = 0;
            index += 1;
        }
    }
}

fn chunk_map_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".chunk");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;

    const OBJECT_SIZE: usize = 3 * CHUNK_SIZE as usize + 123;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn remote_with(key: &str, data: Vec<u8>) -> Arc<dyn ObjectStore> {
        let store = Arc::new(InMemory::new());
        store.put(&ObjectPath::from(key), data.into()).await.unwrap();
        store
    }

    fn no_prefetch() -> CacheOptions {
        CacheOptions {
            prefetch: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[should_panic(expected = "orphaned tasks")]
    async fn close_panics_on_task_ignoring_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let store = remote_with("disk.img", pattern(1024)).await;
        let cache = ObjectCache::open(store, "disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();

        cache.inner.tasks.spawn(std::future::pending::<()>());
        let _ = cache.close().await;
    }

    #[tokio::test]
    async fn read_fetches_and_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(OBJECT_SIZE);
        let store = remote_with("disk.img", data.clone()).await;
        let cache = ObjectCache::open(store, "disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();
        assert_eq!(cache.size(), OBJECT_SIZE as u64);

        let mut buf = vec![0u8; 4096];
        assert_eq!(cache.read_at(&mut buf, 1000).await.unwrap(), 4096);
        assert_eq!(&buf[..], &data[1000..5096]);

        assert_eq!(cache.read_at(&mut buf, 8192).await.unwrap(), 4096);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.fetched_chunks, 1);
        assert_eq!(stats.fetched_bytes, CHUNK_SIZE);
        assert_eq!(stats.cached_chunks, 1);
        assert_eq!(stats.total_chunks, 4);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn straddling_read_fetches_two_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(OBJECT_SIZE);
        let store = remote_with("disk.img", data.clone()).await;
        let cache = ObjectCache::open(store, "disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();

        let offset = CHUNK_SIZE as usize - 100;
        let mut buf = vec![0u8; 300];
        assert_eq!(cache.read_at(&mut buf, offset as u64).await.unwrap(), 300);
        assert_eq!(&buf[..], &data[offset..offset + 300]);
        assert_eq!(cache.stats().fetched_chunks, 2);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_reads_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(OBJECT_SIZE);
        let store = remote_with("disk.img", data.clone()).await;
        let cache = Arc::new(
            ObjectCache::open(store, "disk.img", dir.path(), no_prefetch())
                .await
                .unwrap(),
        );

        let mut readers = Vec::new();
        for i in 0..8u64 {
            let cache = Arc::clone(&cache);
            readers.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 512];
                let offset = CHUNK_SIZE + i * 1000;
                let n = cache.read_at(&mut buf, offset).await.unwrap();
                (offset as usize, n, buf)
            }));
        }
        for reader in readers {
            let (offset, n, buf) = reader.await.unwrap();
            assert_eq!(n, 512);
            assert_eq!(&buf[..], &data[offset..offset + 512]);
        }
        assert_eq!(cache.stats().fetched_chunks, 1);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn tail_read_is_short_and_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(OBJECT_SIZE);
        let store = remote_with("disk.img", data.clone()).await;
        let cache = ObjectCache::open(store, "disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();

        let mut buf = vec![0u8; 1000];
        let offset = OBJECT_SIZE as u64 - 23;
        assert_eq!(cache.read_at(&mut buf, offset).await.unwrap(), 23);
        assert_eq!(&buf[..23], &data[OBJECT_SIZE - 23..]);

        let result = cache.read_at(&mut buf, OBJECT_SIZE as u64).await;
        assert!(matches!(result, Err(CacheError::OutOfRange { .. })));

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_serves_cached_chunks_locally() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(OBJECT_SIZE);
        let store = remote_with("images/disk.img", data.clone()).await;

        let cache = ObjectCache::open(Arc::clone(&store), "images/disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();
        let mut buf = vec![0u8; 100];
        cache.read_at(&mut buf, 2 * CHUNK_SIZE).await.unwrap();
        cache.close().await.unwrap();
        assert!(dir.path().join("images/disk.img.chunk").exists());

        let cache = ObjectCache::open(store, "images/disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();
        assert_eq!(cache.stats().cached_chunks, 1);
        let mut again = vec![0u8; 100];
        cache.read_at(&mut again, 2 * CHUNK_SIZE).await.unwrap();
        assert_eq!(buf, again);
        assert_eq!(cache.stats().fetched_chunks, 0);
        assert_eq!(cache.stats().hits, 1);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn remote_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = remote_with("disk.img", pattern(OBJECT_SIZE)).await;
        let cache = ObjectCache::open(Arc::clone(&store), "disk.img", dir.path(), no_prefetch())
            .await
            .unwrap();
        store.delete(&ObjectPath::from("disk.img")).await.unwrap();

        let mut buf = vec![0u8; 100];
        let result = cache.read_at(&mut buf, 0).await;
        assert!(matches!(result, Err(CacheError::Remote { .. })));
        assert_eq!(cache.stats().fetched_chunks, 0);

        // The failed chunk is not stuck in flight
        assert!(matches!(
            cache.read_at(&mut buf, 0).await,
            Err(CacheError::Remote { .. })
        ));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_object_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let result = ObjectCache::open(store, "nope", dir.path(), no_prefetch()).await;
        assert!(matches!(result, Err(CacheError::Remote { .. })));
    }

    #[tokio::test]
    async fn warm_up_fetches_whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(OBJECT_SIZE);
        let store = remote_with("disk.img", data).await;
        let options = CacheOptions {
            idle_delay: Duration::ZERO,
            ..Default::default()
        };
        let cache = ObjectCache::open(store, "disk.img", dir.path(), options)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while cache.stats().cached_chunks < cache.stats().total_chunks {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("warm-up finished");

        let stats = cache.stats();
        assert_eq!(stats.fetched_chunks, 4);
        assert_eq!(stats.hits + stats.misses, 0);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_background_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = remote_with("disk.img", pattern(OBJECT_SIZE)).await;
        // Warm-up stays parked behind the idle delay
        let cache = ObjectCache::open(store, "disk.img", dir.path(), CacheOptions::default())
            .await
            .unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();

        let mut buf = vec![0u8; 10];
        let result = cache.read_at(&mut buf, 0).await;
        assert!(matches!(result, Err(CacheError::Cancelled(Cause::CacheClosed))));
    }

    #[tokio::test]
    async fn parent_scope_cancels_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = remote_with("disk.img", pattern(OBJECT_SIZE)).await;
        let root = Scope::root();
        let options = CacheOptions {
            prefetch: false,
            parent_scope: Some(root.clone()),
            ..Default::default()
        };
        let cache = ObjectCache::open(store, "disk.img", dir.path(), options)
            .await
            .unwrap();

        root.cancel(Cause::Shutdown);
        let mut buf = vec![0u8; 10];
        let result = cache.read_at(&mut buf, 0).await;
        assert!(matches!(result, Err(CacheError::Cancelled(Cause::Shutdown))));
        cache.close().await.unwrap();
    }
}
