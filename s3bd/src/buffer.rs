//! Pool of reusable fixed-size byte buffers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size of every pooled buffer (64 KiB).
///
/// Also the upper bound for option payloads accepted during negotiation.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Idle buffers kept around for reuse. Extra buffers are freed.
const MAX_IDLE_BUFFERS: usize = 256;

/// Pool handing out `BUFFER_SIZE` byte buffers.
///
/// Buffers must come back at their original size. Returning anything else
/// panics, so a resized buffer never reaches another borrower.
#[derive(Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Borrow a buffer. It goes back to the pool when the guard is dropped.
    ///
    /// Contents are whatever the previous borrower left behind.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not exactly `BUFFER_SIZE` bytes long.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != BUFFER_SIZE {
            panic!(
                "attempted to poison the pool: len={}, want={}",
                buf.len(),
                BUFFER_SIZE
            );
        }
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(buf);
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A borrowed buffer. Derefs to exactly `BUFFER_SIZE` bytes.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
