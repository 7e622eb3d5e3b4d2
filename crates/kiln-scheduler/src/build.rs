//! Builds: externally-created units of work.

use crate::jobset::Jobset;
use crate::step::{visit_dependencies, Step};
use kiln_core::{BuildId, JobsetId};
use kiln_store::StorePath;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// One row of the `builds` table, reflected in memory while unfinished.
pub struct Build {
    pub id: BuildId,
    pub drv_path: StorePath,
    /// Output name to store path, as recorded by the evaluator.
    pub outputs: BTreeMap<String, StorePath>,
    pub jobset_id: JobsetId,
    pub project_name: String,
    pub jobset_name: String,
    pub job_name: String,
    pub timestamp: i64,
    pub max_silent_time: i32,
    pub build_timeout: i32,
    pub local_priority: i32,
    global_priority: AtomicI32,
    pub jobset: Arc<Jobset>,
    toplevel: Mutex<Option<Arc<Step>>>,
    /// Whether this build has started building (for the `build_started`
    /// notification, emitted once).
    started: AtomicBool,
    finished_in_db: AtomicBool,
}

impl Build {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: BuildId,
        drv_path: StorePath,
        outputs: BTreeMap<String, StorePath>,
        jobset_id: JobsetId,
        project_name: String,
        jobset_name: String,
        job_name: String,
        timestamp: i64,
        max_silent_time: i32,
        build_timeout: i32,
        local_priority: i32,
        global_priority: i32,
        jobset: Arc<Jobset>,
    ) -> Self {
        Self {
            id,
            drv_path,
            outputs,
            jobset_id,
            project_name,
            jobset_name,
            job_name,
            timestamp,
            max_silent_time,
            build_timeout,
            local_priority,
            global_priority: AtomicI32::new(global_priority),
            jobset,
            toplevel: Mutex::new(None),
            started: AtomicBool::new(false),
            finished_in_db: AtomicBool::new(false),
        }
    }

    pub fn full_job_name(&self) -> String {
        format!("{}:{}:{}", self.project_name, self.jobset_name, self.job_name)
    }

    pub fn global_priority(&self) -> i32 {
        self.global_priority.load(Ordering::Relaxed)
    }

    pub fn set_global_priority(&self, priority: i32) {
        self.global_priority.store(priority, Ordering::Relaxed);
    }

    pub fn toplevel(&self) -> Option<Arc<Step>> {
        self.toplevel.lock().clone()
    }

    pub fn set_toplevel(&self, step: Arc<Step>) {
        *self.toplevel.lock() = Some(step);
    }

    /// Mark started; true exactly on the first call.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::SeqCst)
    }

    /// Mark finished; true exactly on the first call. Completion writes are
    /// guarded by this so a build is never finished twice.
    pub fn mark_finished_in_db(&self) -> bool {
        !self.finished_in_db.swap(true, Ordering::SeqCst)
    }

    /// Push this build's priorities and jobset down the dependency closure
    /// of its top-level step. Aggregates only ever tighten: priorities go
    /// up, the lowest build id goes down, so re-running after a bump is
    /// safe.
    pub fn propagate_priorities(self: &Arc<Self>) {
        let Some(toplevel) = self.toplevel() else {
            return;
        };
        let global_priority = self.global_priority();
        visit_dependencies(&toplevel, |step| {
            let mut state = step.state.lock();
            state.highest_global_priority = state.highest_global_priority.max(global_priority);
            state.highest_local_priority = state.highest_local_priority.max(self.local_priority);
            state.lowest_build_id = state.lowest_build_id.min(self.id);
            if !state.jobsets.iter().any(|j| Arc::ptr_eq(j, &self.jobset)) {
                state.jobsets.push(self.jobset.clone());
            }
        });
    }
}
