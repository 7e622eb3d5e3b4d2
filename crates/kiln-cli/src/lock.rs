//! The global queue-runner lock.
//!
//! A single instance may drain the queue at a time. The lock is an advisory
//! pid file created exclusively; `--unlock` removes a stale one after a
//! crash.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held")]
    Held,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct GlobalLock {
    path: PathBuf,
}

impl GlobalLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LockError::Held),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Remove the lock file. Returns whether a lock existed.
pub fn unlock(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
