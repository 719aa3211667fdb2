//! Export name to object cache resolution.
//!
//! Each export name maps to the object `<prefix>/<name>` in the remote
//! store. Caches are opened on first lookup and shared by every connection
//! to the same export until [`ExportRegistry::close_all`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use object_store::ObjectStore;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::cache::{CONN_LIMIT_GLOBAL, CacheOptions, ObjectCache, PriorityQueue};
use crate::error::CacheError;
use crate::nbd::Exports;
use crate::scope::Cause;

type Slot = Arc<OnceCell<Arc<ObjectCache>>>;

pub struct ExportRegistry {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    cache_dir: PathBuf,
    options: CacheOptions,
    exports: Mutex<HashMap<String, Slot>>,
    closed: AtomicBool,
}

impl ExportRegistry {
    /// Create a registry for objects under `prefix`, cached in `cache_dir`.
    ///
    /// All caches share one global admission queue, taken from `options`
    /// or created here.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        mut options: CacheOptions,
    ) -> Self {
        options
            .global_queue
            .get_or_insert_with(|| Arc::new(PriorityQueue::new(CONN_LIMIT_GLOBAL)));
        Self {
            store,
            prefix: prefix.into(),
            cache_dir: cache_dir.into(),
            options,
            exports: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Object key serving export `name`.
    pub fn object_key(&self, name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        }
    }

    /// Cache for export `name`, opened on first use.
    ///
    /// Concurrent first lookups of one name open the cache once. A failed
    /// open is not remembered.
    pub async fn open(&self, name: &str) -> Result<Arc<ObjectCache>, CacheError> {
        validate_name(name)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Cancelled(Cause::Shutdown));
        }

        let slot = Arc::clone(self.exports.lock().entry(name.to_string()).or_default());
        let cache = slot
            .get_or_try_init(|| async {
                let key = self.object_key(name);
                let cache = ObjectCache::open(
                    Arc::clone(&self.store),
                    &key,
                    &self.cache_dir,
                    self.options.clone(),
                )
                .await?;
                info!(export = %name, key = %key, "export opened");
                Ok::<_, CacheError>(Arc::new(cache))
            })
            .await?;
        Ok(Arc::clone(cache))
    }

    /// Number of exports with an open cache.
    pub fn len(&self) -> usize {
        self.exports
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every open cache. Lookups fail from here on.
    ///
    /// All caches are closed even if some fail; the first error is returned.
    pub async fn close_all(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::SeqCst);
        let slots: Vec<(String, Slot)> = self.exports.lock().drain().collect();

        let mut first_error = None;
        for (name, slot) in slots {
            let Some(cache) = slot.get() else {
                continue;
            };
            if let Err(e) = cache.close().await {
                warn!(export = %name, error = %e, "failed to close export cache");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Exports for ExportRegistry {
    async fn lookup(&self, name: &str) -> Result<Backend, CacheError> {
        self.open(name).await.map(Backend::Shared)
    }
}

/// Export names become object keys and local paths, so only plain relative
/// paths are accepted.
fn validate_name(name: &str) -> Result<(), CacheError> {
    let valid = !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidExportName {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;

    fn no_prefetch() -> CacheOptions {
        CacheOptions {
            prefetch: false,
            ..Default::default()
        }
    }

    async fn store_with(key: &str, data: &[u8]) -> Arc<InMemory> {
        let store = Arc::new(InMemory::new());
        store
            .put(&ObjectPath::from(key), data.to_vec().into())
            .await
            .unwrap();
        store
    }

    #[test]
    fn object_keys_join_prefix() {
        let store = Arc::new(InMemory::new());
        let registry = ExportRegistry::new(store.clone(), "images/", "/tmp", no_prefetch());
        assert_eq!(registry.object_key("disk.img"), "images/disk.img");

        let registry = ExportRegistry::new(store, "", "/tmp", no_prefetch());
        assert_eq!(registry.object_key("a/b.img"), "a/b.img");
    }

    #[test]
    fn rejects_unsafe_names() {
        for name in ["", "/etc/passwd", "../disk.img", "a/../../b", "./disk.img"] {
            assert!(
                matches!(
                    validate_name(name),
                    Err(CacheError::InvalidExportName { .. })
                ),
                "{name:?} accepted"
            );
        }
        assert!(validate_name("disk.img").is_ok());
        assert!(validate_name("vm/root.img").is_ok());
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("images/disk.img", b"some disk bytes").await;
        let registry = ExportRegistry::new(store, "images", dir.path(), no_prefetch());

        let (a, b) = tokio::join!(registry.open("disk.img"), registry.open("disk.img"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.key(), "images/disk.img");
        assert_eq!(registry.len(), 1);

        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn shared_backend_survives_connection_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("disk.img", b"0123456789").await;
        let registry = ExportRegistry::new(store, "", dir.path(), no_prefetch());

        let backend = registry.lookup("disk.img").await.unwrap();
        assert!(matches!(backend, Backend::Shared(_)));
        backend.close().await.unwrap();

        let backend = registry.lookup("disk.img").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(backend.read_at(&mut buf, 2).await.unwrap(), 4);
        assert_eq!(&buf, b"2345");

        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn failed_open_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemory::new());
        let registry = ExportRegistry::new(store.clone(), "", dir.path(), no_prefetch());

        assert!(registry.lookup("late.img").await.is_err());
        assert!(registry.is_empty());

        store
            .put(&ObjectPath::from("late.img"), b"late".to_vec().into())
            .await
            .unwrap();
        let backend = registry.lookup("late.img").await.unwrap();
        assert_eq!(backend.size(), 4);

        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn lookups_fail_after_close_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("disk.img", b"data").await;
        let registry = ExportRegistry::new(store, "", dir.path(), no_prefetch());

        registry.lookup("disk.img").await.unwrap();
        registry.close_all().await.unwrap();
        assert!(registry.is_empty());

        let Err(err) = registry.lookup("disk.img").await else {
            panic!("lookup succeeded after close_all");
        };
        assert!(err.is_cancelled());
    }
}
