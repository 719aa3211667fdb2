//! s3bd: read-only NBD server for immutable objects in S3 compatible storage.
//!
//! Each NBD export is one remote object. Reads are served from a local,
//! chunk-granular cache that is filled from the object store on demand and
//! in the background while the device is idle.
//!
//! # Library Usage
//!
//! The primary API for running s3bd is the [`Daemon`] struct:
//!
//! ```ignore
//! use s3bd::{Config, Daemon};
//!
//! let daemon = Daemon::from_config(Config::load(path)?)?;
//! daemon.run().await?;
//! ```
//!
//! Embedders that bring their own exports can drive [`NbdServer`] directly
//! with an [`Exports`] implementation.

pub mod backend;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod lockfile;
pub mod nbd;
pub mod registry;
pub mod scope;

pub use backend::{Backend, ReadAt};
pub use buffer::{BUFFER_SIZE, BufferPool, PooledBuffer};
pub use cache::{CHUNK_SIZE, CacheOptions, CacheStats, ObjectCache};
pub use config::{CacheConfig, Config, ListenConfig, Network, S3Config};
pub use daemon::Daemon;
pub use error::{CacheError, ConfigError, Error, NbdError, Result};
pub use lockfile::LockFile;
pub use crate::nbd::{Exports, Listener, NbdServer, StaticExports, StreamListener};
pub use registry::ExportRegistry;
pub use scope::{Cause, Scope};

pub use object_store;
