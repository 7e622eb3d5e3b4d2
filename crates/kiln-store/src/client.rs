//! Remote build machine protocol.
//!
//! A [`Connector`] turns a machine's store URI into a live [`BuildClient`]
//! session. The wire protocol behind a client is an external concern; the
//! scheduling engine only relies on the operations below. An in-process
//! implementation backed by [`MemoryStore`]s serves tests and smoke runs.

use crate::derivation::Derivation;
use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryStore;
use crate::nar::Nar;
use crate::path::StorePath;
use crate::store::{PathInfo, Store};
use async_trait::async_trait;
use chrono::Utc;
use kiln_core::{RemoteBuildResult, RemoteBuildStatus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Options passed along with a `build_derivation` request.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Abort if the build produces no output for this many seconds.
    pub max_silent_time: i32,
    /// Abort after this many seconds of wall clock.
    pub build_timeout: i32,
    pub max_log_size: u64,
    /// Total number of times to perform the build; > 1 checks determinism.
    pub repeats: u32,
    pub enforce_determinism: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_silent_time: 3600,
            build_timeout: 36000,
            max_log_size: 64 << 20,
            repeats: 1,
            enforce_determinism: false,
        }
    }
}

/// One session with a remote build machine.
///
/// At most one `add_to_store` runs per machine at a time (the caller holds
/// the machine's send lock); builds and NAR fetches may overlap across
/// distinct machines.
#[async_trait]
pub trait BuildClient: Send + Sync + std::fmt::Debug {
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> StoreResult<BTreeSet<StorePath>>;

    async fn add_to_store(&self, info: PathInfo, nar: Nar) -> StoreResult<()>;

    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &Derivation,
        options: &BuildOptions,
    ) -> StoreResult<RemoteBuildResult>;

    async fn nar_from_path(&self, path: &StorePath) -> StoreResult<Nar>;
}

/// Opens sessions to build machines by store URI.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, store_uri: &str) -> StoreResult<Box<dyn BuildClient>>;
}

/// Scripted behavior of an in-process machine, consumed one entry per
/// `build_derivation` call. An empty queue means a normal successful build.
#[derive(Debug, Clone, Copy)]
pub enum PlannedOutcome {
    Status(RemoteBuildStatus),
    /// Fail at the transport level, as a dropped connection would.
    Disconnect,
}

/// An in-process build machine: a [`MemoryStore`] plus a builder that
/// realizes derivation outputs deterministically from their names.
pub struct InProcessMachine {
    store: MemoryStore,
    plan: Mutex<HashMap<StorePath, VecDeque<PlannedOutcome>>>,
    built: Mutex<Vec<StorePath>>,
}

impl InProcessMachine {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            store: MemoryStore::new(uri),
            plan: Mutex::new(HashMap::new()),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Queue an outcome for the next build of `drv_path`.
    pub fn plan(&self, drv_path: &StorePath, outcome: PlannedOutcome) {
        self.plan
            .lock()
            .entry(drv_path.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Derivation paths built so far, in order.
    pub fn built(&self) -> Vec<StorePath> {
        self.built.lock().clone()
    }

    fn next_planned(&self, drv_path: &StorePath) -> Option<PlannedOutcome> {
        self.plan.lock().get_mut(drv_path).and_then(VecDeque::pop_front)
    }
}

struct InProcessClient {
    machine: Arc<InProcessMachine>,
}

impl std::fmt::Debug for InProcessClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl BuildClient for InProcessClient {
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> StoreResult<BTreeSet<StorePath>> {
        self.machine.store.query_valid_paths(paths).await
    }

    async fn add_to_store(&self, info: PathInfo, nar: Nar) -> StoreResult<()> {
        self.machine.store.add_to_store(info, nar).await
    }

    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &Derivation,
        options: &BuildOptions,
    ) -> StoreResult<RemoteBuildResult> {
        let start = Utc::now();
        if let Some(outcome) = self.machine.next_planned(drv_path) {
            match outcome {
                PlannedOutcome::Disconnect => {
                    return Err(StoreError::Transport(format!(
                        "connection to {} lost",
                        self.machine.store.uri()
                    )));
                }
                PlannedOutcome::Status(status) => {
                    return Ok(RemoteBuildResult {
                        status,
                        error_msg: match status {
                            RemoteBuildStatus::Built => String::new(),
                            s => format!("planned outcome {s:?}"),
                        },
                        times_built: 1,
                        is_non_deterministic: status == RemoteBuildStatus::NotDeterministic,
                        start_time: start,
                        stop_time: Utc::now(),
                    });
                }
            }
        }

        for (output_name, output_path) in &drv.outputs {
            let contents = format!("built:{}:{}", drv.name, output_name);
            let nar = Nar::from_contents(contents.into_bytes());
            let info = PathInfo {
                path: output_path.clone(),
                nar_size: nar.size(),
                references: BTreeSet::new(),
                deriver: Some(drv_path.clone()),
            };
            self.machine.store.add_to_store(info, nar).await?;
        }
        self.machine.built.lock().push(drv_path.clone());

        Ok(RemoteBuildResult {
            status: RemoteBuildStatus::Built,
            error_msg: String::new(),
            // Output contents are a pure function of the derivation, so
            // every repeat agrees.
            times_built: options.repeats.max(1),
            is_non_deterministic: false,
            start_time: start,
            stop_time: Utc::now(),
        })
    }

    async fn nar_from_path(&self, path: &StorePath) -> StoreResult<Nar> {
        self.machine.store.nar_from_path(path).await
    }
}

/// Connector serving a fixed set of in-process machines keyed by store URI.
#[derive(Default)]
pub struct InProcessConnector {
    machines: Mutex<BTreeMap<String, Arc<InProcessMachine>>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_machine(&self, uri: impl Into<String>) -> Arc<InProcessMachine> {
        let uri = uri.into();
        let machine = Arc::new(InProcessMachine::new(uri.clone()));
        self.machines.lock().insert(uri, machine.clone());
        machine
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self, store_uri: &str) -> StoreResult<Box<dyn BuildClient>> {
        let machine = self
            .machines
            .lock()
            .get(store_uri)
            .cloned()
            .ok_or_else(|| StoreError::Transport(format!("no route to {store_uri}")))?;
        Ok(Box::new(InProcessClient { machine }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_drv(name: &str) -> Derivation {
        Derivation {
            name: name.into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            outputs: [(
                "out".to_string(),
                StorePath::derive(name, &format!("{name}-out")),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn builds_register_outputs() {
        let connector = InProcessConnector::new();
        connector.add_machine("mem://m1");
        let client = connector.connect("mem://m1").await.unwrap();

        let drv = simple_drv("hello");
        let drv_path = StorePath::derive("hello.drv", "hello");
        let result = client
            .build_derivation(&drv_path, &drv, &BuildOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, RemoteBuildStatus::Built);

        let outputs = drv.output_paths();
        let valid = client.query_valid_paths(&outputs).await.unwrap();
        assert_eq!(valid, outputs);
    }

    #[tokio::test]
    async fn planned_outcomes_fire_in_order() {
        let connector = InProcessConnector::new();
        let machine = connector.add_machine("mem://m1");
        let client = connector.connect("mem://m1").await.unwrap();

        let drv = simple_drv("flaky");
        let drv_path = StorePath::derive("flaky.drv", "flaky");
        machine.plan(&drv_path, PlannedOutcome::Disconnect);
        machine.plan(
            &drv_path,
            PlannedOutcome::Status(RemoteBuildStatus::TransientFailure),
        );

        let err = client
            .build_derivation(&drv_path, &drv, &BuildOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transport());

        let result = client
            .build_derivation(&drv_path, &drv, &BuildOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, RemoteBuildStatus::TransientFailure);

        let result = client
            .build_derivation(&drv_path, &drv, &BuildOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, RemoteBuildStatus::Built);
        assert_eq!(machine.built(), vec![drv_path]);
    }

    #[tokio::test]
    async fn unknown_machine_is_a_transport_error() {
        let connector = InProcessConnector::new();
        assert!(connector.connect("mem://nowhere").await.unwrap_err().is_transport());
    }
}
