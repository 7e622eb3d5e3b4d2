//! Store paths.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of the digest part of a store path base name.
const HASH_LEN: usize = 32;

const BASE32_CHARS: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// The base name of a store path: `<digest>-<name>`.
///
/// Store paths are content-addressed; the digest covers the inputs that
/// produced the path, so equal paths hold equal contents and validity can be
/// probed by name alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(base: impl Into<String>) -> StoreResult<Self> {
        let base = base.into();
        let Some((digest, name)) = base.split_once('-') else {
            return Err(StoreError::InvalidPath(base));
        };
        if digest.len() != HASH_LEN
            || !digest.bytes().all(|b| BASE32_CHARS.contains(&b))
            || name.is_empty()
        {
            return Err(StoreError::InvalidPath(base));
        }
        Ok(Self(base))
    }

    /// Derive a store path from a name and arbitrary identifying text.
    /// Used by the in-memory store and by tests to mint valid paths.
    pub fn derive(name: &str, fingerprint: &str) -> Self {
        let digest = Sha256::digest(fingerprint.as_bytes());
        let mut hash = String::with_capacity(HASH_LEN);
        for i in 0..HASH_LEN {
            hash.push(BASE32_CHARS[(digest[i % digest.len()] as usize + i) % 32] as char);
        }
        Self(format!("{hash}-{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the digest.
    pub fn name(&self) -> &str {
        &self.0[HASH_LEN + 1..]
    }

    pub fn digest(&self) -> &str {
        &self.0[..HASH_LEN]
    }

    /// Whether this path names a derivation rather than an output.
    pub fn is_derivation(&self) -> bool {
        self.0.ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for StorePath {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_produces_valid_paths() {
        let path = StorePath::derive("hello-2.12.drv", "seed");
        assert!(path.is_derivation());
        assert_eq!(path.name(), "hello-2.12.drv");
        assert_eq!(path.digest().len(), HASH_LEN);
        StorePath::new(path.as_str()).unwrap();
    }

    #[test]
    fn derive_is_deterministic_and_fingerprint_sensitive() {
        assert_eq!(StorePath::derive("x", "a"), StorePath::derive("x", "a"));
        assert_ne!(StorePath::derive("x", "a"), StorePath::derive("x", "b"));
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(StorePath::new("no-digest").is_err());
        assert!(StorePath::new("").is_err());
        assert!(StorePath::new(format!("{}-", "a".repeat(HASH_LEN))).is_err());
        // 'e' is not in the base-32 alphabet
        assert!(StorePath::new(format!("{}-name", "e".repeat(HASH_LEN))).is_err());
    }
}
