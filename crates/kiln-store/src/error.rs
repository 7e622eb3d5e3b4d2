//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("path not valid in store: {0}")]
    PathNotValid(String),

    #[error("invalid derivation {0}: {1}")]
    InvalidDerivation(String, String),

    #[error("NAR size {size} exceeds limit {limit}")]
    NarTooLarge { size: u64, limit: u64 },

    #[error("malformed NAR: {0}")]
    MalformedNar(String),

    /// Connection-level failure talking to a remote machine or cache.
    /// Distinguished from the other variants because it drives machine
    /// health backoff and step retry.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
