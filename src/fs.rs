//! Filesystem adapter and advisory file locking.
//!
//! The control plane touches the filesystem through the narrow
//! [`FilesystemHandler`] trait so lifecycle tests can observe and stub
//! every directory and file operation. [`StdFilesystem`] is the production
//! implementation; [`FileLock`] is the RAII flock guard the state stores
//! take around every read-modify-write.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Narrow filesystem surface used by the stores and the container service.
pub trait FilesystemHandler: Send + Sync {
    /// Creates a directory and all missing parents with the given mode.
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Writes a file (create or truncate) with the given mode.
    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    /// Writes a file like [`FilesystemHandler::write_file`] and fsyncs it
    /// before returning. Used for the temp file of an atomic save.
    fn write_file_durable(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    /// Reads a whole file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Removes a file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Removes an empty directory (non-recursive).
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Removes a directory tree.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Renames a file (atomic within a filesystem).
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Fsyncs a directory so a preceding rename is durable.
    fn sync_dir(&self, path: &Path) -> io::Result<()>;
}

/// Production [`FilesystemHandler`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFilesystem;

impl FilesystemHandler for StdFilesystem {
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        f.write_all(data)
    }

    fn write_file_durable(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        f.write_all(data)?;
        f.sync_all()
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        File::open(path)?.sync_all()
    }
}

/// Exclusive advisory lock on a lock file.
///
/// Acquisition blocks until the lock is granted. The lock is released when
/// the guard is dropped, on every exit path including panics; the OS also
/// releases it if the process dies.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Opens (or creates, mode 0600) the lock file and takes `LOCK_EX`.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::trace!(lock_path = %path.display(), "acquired file lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::trace!(lock_path = %self.path.display(), "released file lock");
    }
}
