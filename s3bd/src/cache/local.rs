//! Local file holding the cached bytes of one object.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::spawn_blocking;

use crate::error::CacheError;

/// Sparse local copy of a remote object.
///
/// The file is preallocated to the full object size when opened, so disk
/// space runs out at open time rather than in the middle of a fetch.
#[derive(Clone)]
pub struct LocalFile {
    file: Arc<File>,
    size: u64,
}

impl LocalFile {
    pub async fn open(path: impl Into<PathBuf>, size: u64) -> Result<Self, CacheError> {
        let path = path.into();
        let file = spawn_blocking(move || -> io::Result<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o600)
                .open(&path)?;
            preallocate(&file, size)?;
            Ok(file)
        })
        .await
        .map_err(CacheError::task)??;

        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes at `offset`.
    ///
    /// The result is shorter than `len` only at the end of the file.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, CacheError> {
        let file = Arc::clone(&self.file);
        spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
        .await
        .map_err(CacheError::task)?
        .map_err(CacheError::from)
    }

    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), CacheError> {
        let file = Arc::clone(&self.file);
        spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(CacheError::task)?
            .map_err(CacheError::from)
    }

    pub async fn sync(&self) -> Result<(), CacheError> {
        let file = Arc::clone(&self.file);
        spawn_blocking(move || file.sync_data())
            .await
            .map_err(CacheError::task)?
            .map_err(CacheError::from)
    }
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: u64) -> io::Result<()> {
    use nix::fcntl::{FallocateFlags, fallocate};
    use std::os::fd::AsRawFd;

    if size == 0 {
        return Ok(());
    }
    let len = i64::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "object too large"))?;
    match fallocate(file.as_raw_fd(), FallocateFlags::empty(), 0, len) {
        Ok(()) => Ok(()),
        // Filesystems without fallocate support still get a sparse file
        Err(nix::errno::Errno::EOPNOTSUPP) => grow(file, size),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, size: u64) -> io::Result<()> {
    grow(file, size)
}

fn grow(file: &File, size: u64) -> io::Result<()> {
    if file.metadata()?.len() < size {
        file.set_len(size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_preallocates_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/object.img");
        let local = LocalFile::open(&path, 3 * 4096 + 7).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 4096 + 7);
        assert_eq!(local.size(), 3 * 4096 + 7);
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFile::open(dir.path().join("obj"), 1024).await.unwrap();
        local
            .write_at(100, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let data = local.read_at(98, 9).await.unwrap();
        assert_eq!(&data, b"\0\0hello\0\0");
    }

    #[tokio::test]
    async fn read_stops_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFile::open(dir.path().join("obj"), 10).await.unwrap();
        let data = local.read_at(6, 100).await.unwrap();
        assert_eq!(data.len(), 4);
    }

    #[tokio::test]
    async fn reopen_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        let local = LocalFile::open(&path, 64).await.unwrap();
        local.write_at(0, Bytes::from_static(b"abc")).await.unwrap();
        local.sync().await.unwrap();
        drop(local);

        let local = LocalFile::open(&path, 64).await.unwrap();
        assert_eq!(&local.read_at(0, 3).await.unwrap(), b"abc");
    }
}
