//! Hierarchical cancellation with a typed cause.
//!
//! A [`Scope`] wraps a `CancellationToken` and remembers why it was
//! cancelled. Child scopes are cancelled together with their parent and
//! report the nearest cancelled ancestor's cause unless they were cancelled
//! on their own first.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Reason a scope ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    /// The daemon is shutting down.
    Shutdown,
    /// The client connection went away.
    ClientDisconnect,
    /// The owning cache was closed.
    CacheClosed,
    /// The scope ended because of an error.
    Failed(String),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("server shutdown"),
            Self::ClientDisconnect => f.write_str("client disconnected"),
            Self::CacheClosed => f.write_str("cache closed"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    cause: OnceLock<Cause>,
    parent: Option<Scope>,
}

impl Scope {
    /// Create a scope with no parent.
    pub fn root() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a scope that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this scope and all of its children.
    ///
    /// Only the first cause is kept. Cancelling an already cancelled scope
    /// is a no-op.
    pub fn cancel(&self, cause: Cause) {
        if self.inner.token.is_cancelled() {
            return;
        }
        let _ = self.inner.cause.set(cause);
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Wait until the scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Why the scope was cancelled, or `None` while it is still live.
    pub fn cause(&self) -> Option<Cause> {
        if !self.is_cancelled() {
            return None;
        }
        let mut scope = Some(self);
        while let Some(s) = scope {
            if let Some(cause) = s.inner.cause.get() {
                return Some(cause.clone());
            }
            scope = s.inner.parent.as_ref();
        }
        Some(Cause::Failed("cancelled without a cause".to_string()))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.inner.cause.get())
            .finish()
    }
}
