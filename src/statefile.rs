//! Shared persistence protocol for the on-disk state stores.
//!
//! Every store (IPAM, ILM) performs its read-modify-write cycles through
//! [`StateFile::with_lock`], which pins the full discipline:
//!
//! 1. Take the in-process mutex (re-entrance is not permitted).
//! 2. Ensure the parent directory exists (mode 0755).
//! 3. Open-or-create `<path>.lock` (mode 0600) and take an exclusive
//!    advisory flock, released on every exit path.
//! 4. Load the state file; if missing, synthesize the caller's default;
//!    if unparsable, fail with a broken-state error.
//! 5. Run the caller's mutator.
//! 6. Save atomically: pretty JSON plus trailing newline into
//!    `<path>.tmp` (mode 0600), fsync, rename over `<path>`, fsync the
//!    containing directory.
//!
//! The dual locking makes the store correct both across tasks within one
//! process and across cooperating processes sharing the same state file.
//! A reader never observes a partially written state file: the rename is
//! the commit point.

use crate::constants::{DIR_MODE, STATE_FILE_MODE};
use crate::error::{Error, Result};
use crate::fs::{FileLock, FilesystemHandler};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A JSON state file guarded by the dual-lock persistence protocol.
pub struct StateFile<T> {
    path: PathBuf,
    mu: Mutex<()>,
    fs: Arc<dyn FilesystemHandler>,
    _state: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> StateFile<T> {
    pub fn new(path: impl Into<PathBuf>, fs: Arc<dyn FilesystemHandler>) -> Self {
        Self {
            path: path.into(),
            mu: Mutex::new(()),
            fs,
            _state: PhantomData,
        }
    }

    /// Path of the state file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `mutate` over the current state under the full lock discipline
    /// and commits the result. `default_state` is consulted only when the
    /// state file does not exist yet.
    ///
    /// The mutex must not be held by the caller already; the protocol is
    /// not re-entrant.
    pub fn with_lock<R>(
        &self,
        default_state: impl FnOnce() -> Result<T>,
        mutate: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.mu.lock().unwrap_or_else(|poison| poison.into_inner());

        if let Some(parent) = self.path.parent() {
            self.fs.create_dir_all(parent, DIR_MODE)?;
        }

        let lock_path = sibling_path(&self.path, ".lock");
        let _flock = FileLock::acquire(&lock_path)?;

        let mut state = self.load_or_init(default_state)?;
        let out = mutate(&mut state)?;
        self.atomic_save(&state)?;
        Ok(out)
    }

    fn load_or_init(&self, default_state: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.fs.read_file(&self.path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|err| Error::StateJsonBroken {
                    path: self.path.clone(),
                    reason: err.to_string(),
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => default_state(),
            Err(err) => Err(err.into()),
        }
    }

    fn atomic_save(&self, state: &T) -> Result<()> {
        let mut buf =
            serde_json::to_vec_pretty(state).map_err(|err| Error::Serialization(err.to_string()))?;
        buf.push(b'\n');

        let tmp = sibling_path(&self.path, ".tmp");
        self.fs.write_file_durable(&tmp, &buf, STATE_FILE_MODE)?;
        self.fs.rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            self.fs.sync_dir(parent)?;
        }
        Ok(())
    }
}

/// `<path><suffix>` as a sibling of the state file.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
