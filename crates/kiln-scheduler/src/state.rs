//! The scheduler: shared state of all queue-runner tasks.

use crate::build::Build;
use crate::config::RunnerConfig;
use crate::jobset::Jobset;
use crate::machine::Machine;
use crate::step::Step;
use crate::wake::WakeChannel;
use chrono::{DateTime, Utc};
use kiln_core::{BuildId, StepNr};
use kiln_store::{Connector, Store, StorePath};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tracing::debug;

/// Monotonic event counters, exposed by the status dump.
#[derive(Default)]
pub struct Counters {
    pub nr_builds_read: AtomicU64,
    pub build_read_time_ms: AtomicU64,
    pub nr_builds_done: AtomicU64,
    pub nr_steps_started: AtomicU64,
    pub nr_steps_done: AtomicU64,
    pub nr_steps_building: AtomicU64,
    pub nr_steps_copying_to: AtomicU64,
    pub nr_steps_copying_from: AtomicU64,
    pub nr_steps_waiting: AtomicU64,
    pub nr_unsupported_steps: AtomicU64,
    pub nr_retries: AtomicU64,
    pub max_nr_retries: AtomicU64,
    pub total_step_time: AtomicI64,
    pub total_step_build_time: AtomicI64,
    pub nr_queue_wakeups: AtomicU64,
    pub nr_dispatcher_wakeups: AtomicU64,
    pub dispatch_time_ms: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub nr_active_db_updates: AtomicU64,
}

/// RAII increment of a gauge-style counter.
pub struct GaugeGuard<'a>(&'a AtomicU64);

impl<'a> GaugeGuard<'a> {
    pub fn new(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-system-type demand statistics, the feed for machine autoscaling.
#[derive(Debug, Default, Clone)]
pub struct MachineTypeStats {
    pub runnable: u32,
    pub running: u32,
    pub last_active: Option<DateTime<Utc>>,
    /// Accumulated seconds runnable steps of this type have waited.
    pub wait_time_secs: i64,
}

/// Handle on a step a worker is executing; lets the monitor request
/// cooperative cancellation.
pub struct ActiveStep {
    pub step: Arc<Step>,
    cancelled: AtomicBool,
}

impl ActiveStep {
    pub fn new(step: Arc<Step>) -> Self {
        Self {
            step,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A paired claim on a step and a machine slot. Constructing one increments
/// the machine's job count; dropping it releases the slot and wakes the
/// dispatcher.
pub struct MachineReservation {
    pub step: Arc<Step>,
    pub machine: Arc<Machine>,
    scheduler: Arc<Scheduler>,
}

impl MachineReservation {
    /// Claim a slot on `machine` for `step`. Fails when the machine is at
    /// capacity; the check and increment are one atomic operation, so two
    /// dispatch passes cannot oversubscribe a machine.
    pub fn try_new(
        scheduler: Arc<Scheduler>,
        step: Arc<Step>,
        machine: Arc<Machine>,
    ) -> Option<Self> {
        let jobs = &machine.state.current_jobs;
        let mut current = jobs.load(Ordering::SeqCst);
        loop {
            if current >= machine.max_jobs {
                return None;
            }
            match jobs.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        {
            let mut types = scheduler.machine_types.lock();
            let stats = types.entry(step.system_type.clone()).or_default();
            stats.running += 1;
            stats.last_active = Some(Utc::now());
        }
        Some(Self {
            step,
            machine,
            scheduler,
        })
    }
}

impl Drop for MachineReservation {
    fn drop(&mut self) {
        let remaining = self.machine.state.current_jobs.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.machine
                .state
                .idle_since
                .store(Utc::now().timestamp(), Ordering::SeqCst);
        }
        {
            let mut types = self.scheduler.machine_types.lock();
            if let Some(stats) = types.get_mut(&self.step.system_type) {
                stats.running = stats.running.saturating_sub(1);
            }
        }
        self.scheduler.dispatcher_wake.wake();
    }
}

/// All registries and channels of the queue runner. One value, shared by
/// every task; nothing is a process-wide singleton.
///
/// Lock order when more than one container must be held:
/// `builds` < `steps` < `jobsets` < `machines` < `runnable`. No task holds
/// more than three at once, and none is held across I/O.
pub struct Scheduler {
    pub config: RunnerConfig,
    pub pool: PgPool,
    /// Where derivations are read from.
    pub local_store: Arc<dyn Store>,
    /// Where outputs are registered.
    pub dest_store: Arc<dyn Store>,
    pub connector: Arc<dyn Connector>,

    pub builds: Mutex<HashMap<BuildId, Arc<Build>>>,
    pub steps: Mutex<HashMap<StorePath, Weak<Step>>>,
    pub jobsets: Mutex<HashMap<(String, String), Arc<Jobset>>>,
    pub machines: Mutex<HashMap<String, Arc<Machine>>>,
    /// Steps with no unbuilt dependencies, awaiting dispatch.
    pub runnable: Mutex<Vec<Weak<Step>>>,
    pub active_steps: Mutex<Vec<Arc<ActiveStep>>>,
    pub machine_types: Mutex<HashMap<String, MachineTypeStats>>,
    /// Step rows whose database writes failed; cleaned up by the monitor.
    pub orphaned_steps: Mutex<HashSet<(BuildId, StepNr)>>,

    pub dispatcher_wake: WakeChannel,
    pub queue_wake: WakeChannel,
    /// Throttle for CPU-bound local work.
    pub local_work_throttle: Semaphore,
    /// Global bound on concurrent closure uploads.
    pub copy_closure_throttle: Semaphore,

    pub counters: Counters,
    pub started_at: DateTime<Utc>,
    /// Restrict work to a single build and stop when it finishes.
    pub build_one: Option<BuildId>,
    build_one_status: Mutex<Option<kiln_core::BuildStatus>>,
    pub build_one_done: WakeChannel,
}

impl Scheduler {
    pub fn new(
        config: RunnerConfig,
        pool: PgPool,
        local_store: Arc<dyn Store>,
        dest_store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        build_one: Option<BuildId>,
    ) -> Arc<Self> {
        let local_work_throttle = Semaphore::new(config.max_local_workers.max(1));
        let copy_closure_throttle = Semaphore::new(config.max_parallel_copy_closure.max(1));
        Arc::new(Self {
            config,
            pool,
            local_store,
            dest_store,
            connector,
            builds: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            jobsets: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            runnable: Mutex::new(Vec::new()),
            active_steps: Mutex::new(Vec::new()),
            machine_types: Mutex::new(HashMap::new()),
            orphaned_steps: Mutex::new(HashSet::new()),
            dispatcher_wake: WakeChannel::new(),
            queue_wake: WakeChannel::new(),
            local_work_throttle,
            copy_closure_throttle,
            counters: Counters::default(),
            started_at: Utc::now(),
            build_one,
            build_one_status: Mutex::new(None),
            build_one_done: WakeChannel::new(),
        })
    }

    /// Move a fully-wired step with no outstanding dependencies onto the
    /// runnable list and wake the dispatcher.
    pub fn make_runnable(&self, step: &Arc<Step>) {
        {
            let mut state = step.state.lock();
            debug_assert!(state.created);
            debug_assert!(state.deps.is_empty());
            state.runnable_since = Utc::now();
        }
        debug!(drv = %step.drv_path, system = %step.system_type, "step is runnable");
        self.runnable.lock().push(Arc::downgrade(step));
        self.dispatcher_wake.wake();
    }

    /// Remove a step from the index; it will be gone once the last owner
    /// drops it.
    pub fn forget_step(&self, drv_path: &StorePath) {
        self.steps.lock().remove(drv_path);
    }

    pub fn register_active(&self, active: Arc<ActiveStep>) {
        self.active_steps.lock().push(active);
    }

    pub fn deregister_active(&self, active: &Arc<ActiveStep>) {
        self.active_steps
            .lock()
            .retain(|a| !Arc::ptr_eq(a, active));
    }

    /// Record that a build finished, for `--build-one` runs.
    pub fn note_build_finished(&self, build_id: BuildId, status: kiln_core::BuildStatus) {
        if self.build_one == Some(build_id) {
            *self.build_one_status.lock() = Some(status);
            self.build_one_done.wake();
        }
    }

    pub fn build_one_status(&self) -> Option<kiln_core::BuildStatus> {
        *self.build_one_status.lock()
    }

    /// Write a GC root marker for a realized output so it survives garbage
    /// collection while the runner is tracking it.
    pub async fn add_root(&self, path: &StorePath) -> std::io::Result<()> {
        let Some(roots_dir) = &self.config.roots_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(roots_dir).await?;
        tokio::fs::write(roots_dir.join(path.as_str()), "").await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::machine::parse_machines;
    use kiln_store::{InProcessConnector, MemoryStore};
    use sqlx::postgres::PgPoolOptions;

    /// A scheduler over in-memory stores and an unconnected (lazy) pool.
    /// Tests exercising only the in-memory graph never touch the pool.
    pub fn make_scheduler(config: RunnerConfig) -> (Arc<Scheduler>, Arc<InProcessConnector>, Arc<MemoryStore>, Arc<MemoryStore>) {
        // `connect_lazy` spawns a maintenance task, which needs a Tokio
        // context even though the pool itself is never driven in tests.
        static RUNTIME: std::sync::OnceLock<tokio::runtime::Runtime> = std::sync::OnceLock::new();
        let _guard = RUNTIME
            .get_or_init(|| tokio::runtime::Runtime::new().expect("test runtime"))
            .enter();
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://unused@localhost/unused")
            .expect("lazy pool");
        let local = Arc::new(MemoryStore::new("local"));
        let dest = Arc::new(MemoryStore::new("dest"));
        let connector = Arc::new(InProcessConnector::new());
        let scheduler = Scheduler::new(
            config,
            pool,
            local.clone(),
            dest.clone(),
            connector.clone(),
            None,
        );
        (scheduler, connector, local, dest)
    }

    pub fn install_machines(scheduler: &Scheduler, spec: &str) -> Vec<Arc<Machine>> {
        let machines: Vec<Arc<Machine>> = parse_machines(spec).into_iter().map(Arc::new).collect();
        let mut map = scheduler.machines.lock();
        for machine in &machines {
            map.insert(machine.store_uri.clone(), machine.clone());
        }
        machines
    }
}
