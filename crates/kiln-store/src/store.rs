//! The store trait.

use crate::derivation::Derivation;
use crate::error::StoreResult;
use crate::nar::Nar;
use crate::path::StorePath;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metadata registered for a valid store path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathInfo {
    pub path: StorePath,
    pub nar_size: u64,
    /// Store paths this path refers to; together they form its closure.
    pub references: BTreeSet<StorePath>,
    /// The derivation that produced this path, if known.
    pub deriver: Option<StorePath>,
}

/// A store holding realized build outputs and derivations.
///
/// Both the local store (where derivations are read from) and the
/// destination store (where outputs end up) are accessed through this trait;
/// concrete backends never leak into the scheduling engine.
#[async_trait]
pub trait Store: Send + Sync {
    /// Identifying URI, for logs and status output.
    fn uri(&self) -> String;

    /// The subset of `paths` that is present and valid.
    async fn query_valid_paths(&self, paths: &BTreeSet<StorePath>) -> StoreResult<BTreeSet<StorePath>>;

    async fn query_path_info(&self, path: &StorePath) -> StoreResult<Option<PathInfo>>;

    /// Parse the derivation stored at `path`.
    async fn read_derivation(&self, path: &StorePath) -> StoreResult<Derivation>;

    /// Import a serialized path, registering it as valid.
    async fn add_to_store(&self, info: PathInfo, nar: Nar) -> StoreResult<()>;

    async fn nar_from_path(&self, path: &StorePath) -> StoreResult<Nar>;
}

/// The transitive closure of `roots` under path references.
///
/// Each path's info is looked up in `stores` in order, so a closure can
/// span several stores (dependency outputs in a destination store, sources
/// in the local one). Paths no store knows are included but not expanded;
/// the caller decides whether that is an error.
pub async fn compute_closure(
    stores: &[&dyn Store],
    roots: BTreeSet<StorePath>,
) -> StoreResult<BTreeSet<StorePath>> {
    let mut closure = BTreeSet::new();
    let mut todo: Vec<StorePath> = roots.into_iter().collect();
    while let Some(path) = todo.pop() {
        if !closure.insert(path.clone()) {
            continue;
        }
        for store in stores {
            if let Some(info) = store.query_path_info(&path).await? {
                for reference in info.references {
                    if !closure.contains(&reference) {
                        todo.push(reference);
                    }
                }
                break;
            }
        }
    }
    Ok(closure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn closure_follows_references() {
        let store = MemoryStore::new("test");
        let lib = store.add_text("libc", "libc", &[]);
        let ssl = store.add_text("openssl", "openssl", &[lib.clone()]);
        let app = store.add_text("app", "app", &[ssl.clone(), lib.clone()]);

        let closure = compute_closure(&[&store], [app.clone()].into_iter().collect())
            .await
            .unwrap();
        assert_eq!(closure, [app, ssl, lib].into_iter().collect());
    }

    #[tokio::test]
    async fn closure_spans_stores_in_lookup_order() {
        let dest = MemoryStore::new("dest");
        let local = MemoryStore::new("local");
        // the root lives in the destination store and references a source
        // known only to the local store
        let src = local.add_text("src", "src", &[]);
        let out = dest.add_text("out", "out", &[src.clone()]);
        // unknown paths are kept but not expanded
        let ghost = StorePath::derive("ghost", "ghost");

        let closure = compute_closure(
            &[&dest, &local],
            [out.clone(), ghost.clone()].into_iter().collect(),
        )
        .await
        .unwrap();
        assert_eq!(closure, [out, src, ghost].into_iter().collect());
    }
}
