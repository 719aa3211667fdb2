//! Exclusive ownership of a cache directory.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// An advisory `flock` held on a file for the lifetime of the value.
///
/// Dropping the lock releases it; [`LockFile::release`] does the same and
/// reports errors.
pub struct LockFile {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl LockFile {
    /// Take the lock at `path` without waiting.
    ///
    /// Fails with [`Error::Locked`] if another open file holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(&path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Err(Error::Locked { path }),
            Err((_, errno)) => return Err(io::Error::from(errno).into()),
        };
        debug!(path = %path.display(), "lock acquired");
        Ok(Self {
            path,
            lock: Some(lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file and unlock it.
    pub fn release(mut self) -> Result<()> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        let removed = std::fs::remove_file(&self.path);
        lock.unlock().map_err(|(_, errno)| io::Error::from(errno))?;
        removed?;
        debug!(path = %self.path.display(), "lock released");
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release lock file");
        }
    }
}
