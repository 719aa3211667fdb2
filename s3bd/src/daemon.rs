//! Daemon API for running s3bd.
//!
//! Ties configuration, the cache directory lock, the export registry and
//! the NBD server together.
//!
//! # Example
//!
//! ```ignore
//! use s3bd::{Config, Daemon};
//!
//! let daemon = Daemon::from_config(Config::load(path)?)?;
//! tokio::select! {
//!     result = daemon.run() => result?,
//!     _ = tokio::signal::ctrl_c() => {}
//! }
//! daemon.shutdown().await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::CacheOptions;
use crate::config::{Config, ListenConfig, Network};
use crate::error::{ConfigError, Error, NbdError, Result};
use crate::lockfile::LockFile;
use crate::nbd::{Listener, NbdServer};
use crate::registry::ExportRegistry;
use crate::scope::{Cause, Scope};

/// Name of the lock file inside the cache directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// A configured s3bd instance.
pub struct Daemon {
    config: Config,
    cache_dir: PathBuf,
    scope: Scope,
    registry: Arc<ExportRegistry>,
    server: NbdServer,
    lock: Mutex<Option<LockFile>>,
}

impl Daemon {
    /// Prepare a daemon from configuration.
    ///
    /// Takes the cache directory lock, so a second daemon on the same
    /// directory fails here with [`Error::Locked`].
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let cache_dir = std::path::absolute(&config.cache.dir)?;
        std::fs::create_dir_all(&cache_dir)?;
        let lock = LockFile::acquire(cache_dir.join(LOCK_FILE_NAME))?;

        let store = config.s3.build_object_store()?;
        let scope = Scope::root();
        let options = CacheOptions {
            prefetch: config.cache.prefetch,
            parent_scope: Some(scope.clone()),
            ..Default::default()
        };
        let registry = Arc::new(ExportRegistry::new(
            store,
            config.s3.prefix.clone(),
            &cache_dir,
            options,
        ));
        let server = NbdServer::new(&scope, registry.clone());

        info!(
            endpoint = %config.s3.endpoint,
            bucket = %config.s3.bucket,
            prefix = %config.s3.prefix,
            cache_dir = %cache_dir.display(),
            "daemon configured"
        );

        Ok(Self {
            config,
            cache_dir,
            scope,
            registry,
            server,
            lock: Mutex::new(Some(lock)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Absolute path of the cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    pub fn server(&self) -> &NbdServer {
        &self.server
    }

    /// Serve on every configured listen target until shutdown.
    ///
    /// All targets are bound before serving starts. A listener that fails
    /// later is logged and does not stop the others; its error is returned
    /// once all listeners have stopped.
    pub async fn run(&self) -> Result<()> {
        if self.config.listen.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "listen",
                reason: "at least one listen target is required",
            }
            .into());
        }

        let mut listeners = JoinSet::new();
        for target in &self.config.listen {
            match target.network {
                Network::Tcp => {
                    let listener = TcpListener::bind(&target.address).await?;
                    self.spawn_listener(&mut listeners, target, listener);
                }
                Network::Unix => {
                    remove_stale_socket(Path::new(&target.address))?;
                    let listener = UnixListener::bind(&target.address)?;
                    self.spawn_listener(&mut listeners, target, listener);
                }
            }
        }

        let mut first_error = None;
        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(listener = %name, "listener stopped"),
                Ok((name, Err(e))) => {
                    error!(listener = %name, error = %e, "nbd listener failed");
                    first_error.get_or_insert(Error::Nbd(e));
                }
                Err(e) => {
                    error!(error = %e, "nbd listener task failed");
                    first_error.get_or_insert(Error::Io(std::io::Error::other(e)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn spawn_listener<L>(
        &self,
        listeners: &mut JoinSet<(String, std::result::Result<(), NbdError>)>,
        target: &ListenConfig,
        listener: L,
    ) where
        L: Listener + 'static,
    {
        let name = target.to_string();
        info!(listener = %name, "listening");
        let server = self.server.clone();
        listeners.spawn(async move {
            let result = server.listen(listener).await;
            (name, result)
        });
    }

    /// Stop serving, close every cache and release the directory lock.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.server.shutdown().await;
        let closed = self.registry.close_all().await;
        self.scope.cancel(Cause::Shutdown);

        let lock = self.lock.lock().take();
        if let Some(lock) = lock {
            lock.release()?;
        }
        closed?;
        info!("shutdown complete");
        Ok(())
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
