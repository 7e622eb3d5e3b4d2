//! In-memory store backend.
//!
//! Backs unit and scenario tests, and `--build-one` smoke runs where no real
//! store is configured. Contents live in process memory; NARs round-trip
//! byte-for-byte.

use crate::derivation::Derivation;
use crate::error::{StoreError, StoreResult};
use crate::nar::Nar;
use crate::path::StorePath;
use crate::store::{PathInfo, Store};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
struct Inner {
    paths: BTreeMap<StorePath, (PathInfo, Nar)>,
    derivations: BTreeMap<StorePath, Derivation>,
}

pub struct MemoryStore {
    uri: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a valid path holding `contents`, with the given references.
    /// Returns the minted store path.
    pub fn add_text(&self, name: &str, contents: &str, references: &[StorePath]) -> StorePath {
        let path = StorePath::derive(name, contents);
        let nar = Nar::from_contents(Bytes::copy_from_slice(contents.as_bytes()));
        let info = PathInfo {
            path: path.clone(),
            nar_size: nar.size(),
            references: references.iter().cloned().collect(),
            deriver: None,
        };
        self.inner.lock().paths.insert(path.clone(), (info, nar));
        path
    }

    /// Store a derivation and register its path as valid.
    pub fn add_derivation(&self, drv: Derivation) -> StorePath {
        let path = StorePath::derive(
            &format!("{}.drv", drv.name),
            &format!("{}:{}:{:?}", drv.name, drv.platform, drv.outputs),
        );
        let rendered = serde_json::to_vec(&drv).unwrap_or_default();
        let nar = Nar::from_contents(Bytes::from(rendered));
        let info = PathInfo {
            path: path.clone(),
            nar_size: nar.size(),
            references: drv.input_drvs.keys().cloned().collect(),
            deriver: None,
        };
        let mut inner = self.inner.lock();
        inner.paths.insert(path.clone(), (info, nar));
        inner.derivations.insert(path.clone(), drv);
        path
    }

    pub fn contains(&self, path: &StorePath) -> bool {
        self.inner.lock().paths.contains_key(path)
    }

    pub fn remove(&self, path: &StorePath) {
        self.inner.lock().paths.remove(path);
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn uri(&self) -> String {
        format!("memory://{}", self.uri)
    }

    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> StoreResult<BTreeSet<StorePath>> {
        let inner = self.inner.lock();
        Ok(paths
            .iter()
            .filter(|p| inner.paths.contains_key(*p))
            .cloned()
            .collect())
    }

    async fn query_path_info(&self, path: &StorePath) -> StoreResult<Option<PathInfo>> {
        Ok(self.inner.lock().paths.get(path).map(|(info, _)| info.clone()))
    }

    async fn read_derivation(&self, path: &StorePath) -> StoreResult<Derivation> {
        self.inner
            .lock()
            .derivations
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::PathNotValid(path.to_string()))
    }

    async fn add_to_store(&self, info: PathInfo, nar: Nar) -> StoreResult<()> {
        self.inner.lock().paths.insert(info.path.clone(), (info, nar));
        Ok(())
    }

    async fn nar_from_path(&self, path: &StorePath) -> StoreResult<Nar> {
        self.inner
            .lock()
            .paths
            .get(path)
            .map(|(_, nar)| nar.clone())
            .ok_or_else(|| StoreError::PathNotValid(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn derivation_round_trip() {
        let store = MemoryStore::new("t");
        let out = StorePath::derive("hello", "hello-out");
        let drv = Derivation {
            name: "hello".into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            outputs: [("out".to_string(), out)].into_iter().collect(),
            ..Default::default()
        };
        let path = store.add_derivation(drv);
        assert!(path.is_derivation());
        let read = store.read_derivation(&path).await.unwrap();
        assert_eq!(read.name, "hello");

        let missing = StorePath::derive("missing.drv", "x");
        assert!(store.read_derivation(&missing).await.is_err());
    }
}
