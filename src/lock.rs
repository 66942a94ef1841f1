//! Mutual exclusion for shared durable records.
//!
//! Two primitives that are NOT interchangeable:
//!
//! - [`KeyedMutex`] serializes threads inside one process.
//! - [`FileLock`] serializes separate processes. Advisory lock semantics
//!   within a single process vary by platform (fcntl-style locks are owned
//!   by the process, so a second acquire from the same process succeeds),
//!   so in-process callers must also hold the keyed mutex.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("creating lock directory for {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("opening lock file {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("acquiring lock {path:?}: {source}")]
    Acquire { path: PathBuf, source: io::Error },
    #[error("lock {path:?} is held by another process")]
    Contended { path: PathBuf },
}

/// Table of named mutexes, created on first use and kept for the life of
/// the table.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex for `key`, shared by every caller using the same key.
    pub fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Run `f` while holding the mutex for `key`.
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let handle = self.handle(key);
        let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        FileExt::lock_exclusive(&file).map_err(|source| LockError::Acquire {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::trace!(path = %path.display(), "file lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it.
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::Contended {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => Err(LockError::Acquire {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = crate::error::BestEffort::from_result(
            "release file lock",
            FileExt::unlock(&self.file).map_err(|e| format!("{}: {e}", self.path.display())),
        );
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| LockError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}
