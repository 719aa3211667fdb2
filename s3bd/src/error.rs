//! Error types for s3bd.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

use crate::scope::{Cause, Scope};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cache directory is locked by another process: {}", path.display())]
    Locked { path: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Object cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("remote store error: {message}")]
    Remote { message: String },

    #[error("local storage error: {0}")]
    Local(#[from] io::Error),

    #[error("corrupt chunk map {}: {reason}", path.display())]
    CorruptChunkMap { path: PathBuf, reason: String },

    #[error("offset {offset} is beyond the end of the object ({size} bytes)")]
    OutOfRange { offset: u64, size: u64 },

    #[error("short fetch of chunk {index}: got {actual_bytes} bytes, want {expected_bytes}")]
    ShortFetch {
        index: u64,
        actual_bytes: u64,
        expected_bytes: u64,
    },

    #[error("fetch of chunk {index} did not complete")]
    FetchAbandoned { index: u64 },

    #[error("operation cancelled: {0}")]
    Cancelled(Cause),

    #[error("invalid export name: {name:?}")]
    InvalidExportName { name: String },

    #[error("unknown export: {name:?}")]
    UnknownExport { name: String },

    #[error("background task failed: {message}")]
    Task { message: String },
}

impl CacheError {
    pub fn remote(err: impl std::fmt::Display) -> Self {
        Self::Remote {
            message: err.to_string(),
        }
    }

    pub fn task(err: impl std::fmt::Display) -> Self {
        Self::Task {
            message: err.to_string(),
        }
    }

    /// Error for work interrupted by the cancellation of `scope`.
    pub fn cancelled(scope: &Scope) -> Self {
        Self::Cancelled(scope.cause().unwrap_or(Cause::Shutdown))
    }

    /// Whether the error was caused by cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unsupported endpoint scheme: {scheme}")]
    UnsupportedScheme { scheme: String },
}
