//! Configuration for s3bd.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub s3: S3Config,
    pub cache: CacheConfig,
    #[serde(default)]
    pub listen: Vec<ListenConfig>,
}

/// Remote object store holding the exported images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// `http(s)://host[:port]` of an S3 compatible service, `file:///dir`
    /// for a local directory, or `memory://`.
    pub endpoint: String,
    pub bucket: String,
    /// Key prefix prepended to export names.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl S3Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "s3.endpoint",
                reason: "must not be empty",
            });
        }
        if self.bucket.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "s3.bucket",
                reason: "must not be empty",
            });
        }
        if self.access.is_some() != self.secret.is_some() {
            return Err(ConfigError::InvalidValue {
                field: "s3.access",
                reason: "access and secret must be set together",
            });
        }
        Ok(())
    }

    /// Connect to the configured object store.
    ///
    /// For `file://` endpoints the bucket is a directory below the endpoint
    /// path and is created if missing.
    pub fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        let url = Url::parse(&self.endpoint).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {
                let mut builder = AmazonS3Builder::new()
                    .with_endpoint(self.endpoint.trim_end_matches('/'))
                    .with_bucket_name(&self.bucket)
                    .with_region(self.region.as_deref().unwrap_or(DEFAULT_REGION))
                    .with_virtual_hosted_style_request(false)
                    .with_allow_http(url.scheme() == "http");
                builder = match (&self.access, &self.secret) {
                    (Some(access), Some(secret)) => builder
                        .with_access_key_id(access)
                        .with_secret_access_key(secret),
                    _ => builder.with_skip_signature(true),
                };
                let store = builder
                    .build()
                    .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                Ok(Arc::new(store))
            }
            "file" => {
                let root = Path::new(url.path()).join(&self.bucket);
                std::fs::create_dir_all(&root).map_err(ConfigError::ReadError)?;
                let store = LocalFileSystem::new_with_prefix(&root)
                    .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(InMemory::new())),
            scheme => Err(ConfigError::UnsupportedScheme {
                scheme: scheme.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding cached objects, their chunk maps and the lock file.
    pub dir: PathBuf,
    /// Fetch whole objects in the background while idle.
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

fn default_prefetch() -> bool {
    true
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache.dir",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

/// One socket the NBD server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    pub network: Network,
    /// `host:port` for TCP, a socket path for Unix.
    pub address: String,
}

impl ListenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "listen.address",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

impl fmt::Display for ListenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Network::Tcp => write!(f, "tcp://{}", self.address),
            Network::Unix => write!(f, "unix://{}", self.address),
        }
    }
}

/// Parses `tcp://host:port` and `unix:///path/to/socket`.
impl FromStr for ListenConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ConfigError::ParseError(format!("{s:?}: {e}")))?;
        match url.scheme() {
            "tcp" => {
                let host = url.host_str().ok_or(ConfigError::InvalidValue {
                    field: "listen.address",
                    reason: "tcp address must have a host",
                })?;
                let port = url.port().ok_or(ConfigError::InvalidValue {
                    field: "listen.address",
                    reason: "tcp address must have a port",
                })?;
                Ok(Self {
                    network: Network::Tcp,
                    address: format!("{host}:{port}"),
                })
            }
            "unix" => {
                let listen = Self {
                    network: Network::Unix,
                    address: url.path().to_string(),
                };
                listen.validate()?;
                Ok(listen)
            }
            scheme => Err(ConfigError::UnsupportedScheme {
                scheme: scheme.to_string(),
            }),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.s3.validate()?;
        self.cache.validate()?;
        for listen in &self.listen {
            listen.validate()?;
        }
        Ok(())
    }
}
