//! Export lookup seam between the protocol server and its backends.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::CacheError;

/// Resolves export names requested during negotiation.
///
/// Implemented by the daemon's `ExportRegistry` and by [`StaticExports`].
#[async_trait]
pub trait Exports: Send + Sync {
    /// Find the backend serving `name`.
    async fn lookup(&self, name: &str) -> Result<Backend, CacheError>;
}

/// A fixed set of exports known up front.
#[derive(Clone, Default)]
pub struct StaticExports {
    exports: HashMap<String, Backend>,
}

impl StaticExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, backend: Backend) -> Self {
        self.exports.insert(name.into(), backend);
        self
    }
}

#[async_trait]
impl Exports for StaticExports {
    async fn lookup(&self, name: &str) -> Result<Backend, CacheError> {
        self.exports
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownExport {
                name: name.to_string(),
            })
    }
}
