//! Two-level admission control for remote fetches.
//!
//! Every holder owns one slot in its priority class and one slot in the
//! shared global pool. All three pools are bounded channels of the same
//! capacity: sending reserves a slot, receiving frees one.
//!
//! While the global pool has room there is no difference between the two
//! classes. Under contention `release` frees normal-priority slots first, so
//! queued normal-priority acquisitions are serviced before low-priority ones.

use tokio::sync::{Mutex, mpsc};

use crate::error::CacheError;
use crate::scope::Scope;

/// Maximum simultaneous fetches for one object.
pub const CONN_LIMIT_PER_OBJECT: usize = 16;

/// Maximum simultaneous fetches across all objects.
pub const CONN_LIMIT_GLOBAL: usize = 64;

struct Pool {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Pool {
    fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    async fn reserve(&self, scope: &Scope) -> Result<(), CacheError> {
        tokio::select! {
            biased;
            _ = scope.cancelled() => Err(CacheError::cancelled(scope)),
            // The receiver lives as long as the sender, so sending cannot fail.
            _ = self.tx.send(()) => Ok(()),
        }
    }

    async fn give_back(&self) {
        let _ = self.rx.lock().await.try_recv();
    }
}

pub struct PriorityQueue {
    normal: Pool,
    low: Pool,
    global: Pool,
}

impl PriorityQueue {
    pub fn new(size: usize) -> Self {
        Self {
            normal: Pool::new(size),
            low: Pool::new(size),
            global: Pool::new(size),
        }
    }

    /// Take a normal-priority slot.
    pub async fn acquire(&self, scope: &Scope) -> Result<(), CacheError> {
        self.acquire_in(&self.normal, scope).await
    }

    /// Take a low-priority slot.
    pub async fn acquire_low_priority(&self, scope: &Scope) -> Result<(), CacheError> {
        self.acquire_in(&self.low, scope).await
    }

    async fn acquire_in(&self, class: &Pool, scope: &Scope) -> Result<(), CacheError> {
        class.reserve(scope).await?;
        if let Err(e) = self.global.reserve(scope).await {
            class.give_back().await;
            return Err(e);
        }
        Ok(())
    }

    /// Give back a slot taken by `acquire` or `acquire_low_priority`.
    ///
    /// Calling this without holding a slot blocks forever.
    pub async fn release(&self) {
        let _ = self.global.rx.lock().await.recv().await;

        let mut normal = self.normal.rx.lock().await;
        if normal.try_recv().is_ok() {
            return;
        }
        let mut low = self.low.rx.lock().await;
        tokio::select! {
            _ = normal.recv() => {}
            _ = low.recv() => {}
        }
    }
}
