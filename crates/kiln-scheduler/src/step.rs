//! Steps: the unit of scheduling.

use crate::build::Build;
use crate::jobset::Jobset;
use chrono::{DateTime, Utc};
use kiln_core::BuildId;
use kiln_store::{Derivation, DerivationOptions, StorePath};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A single derivation to realize.
///
/// Forward edges (`deps`) own their targets; reverse edges (`rdeps`, the
/// builds list) are weak. A step stays alive exactly as long as some build
/// needs it or a worker holds it.
pub struct Step {
    pub drv_path: StorePath,
    pub drv: Derivation,
    pub options: DerivationOptions,
    /// Platform plus required features; the capability-matching key.
    pub system_type: String,
    finished: AtomicBool,
    pub state: Mutex<StepState>,
}

pub struct StepState {
    /// Whether initialisation (dependency wiring) has completed.
    pub created: bool,
    /// Steps this step is still waiting on, keyed by derivation path.
    pub deps: HashMap<StorePath, Arc<Step>>,
    /// Steps waiting on this step.
    pub rdeps: Vec<Weak<Step>>,
    /// Builds that have this step as their top-level derivation.
    pub builds: Vec<Weak<Build>>,
    /// Jobsets of builds that reach this step; drives fair-share choice.
    pub jobsets: Vec<Arc<Jobset>>,
    pub tries: u32,
    /// Earliest next attempt, when a retry is pending.
    pub after: Option<DateTime<Utc>>,
    pub highest_global_priority: i32,
    pub highest_local_priority: i32,
    pub lowest_build_id: BuildId,
    pub runnable_since: DateTime<Utc>,
    /// Last time a machine capable of this step existed.
    pub last_supported: DateTime<Utc>,
}

impl Step {
    pub fn new(drv_path: StorePath, drv: Derivation, this_system: &str) -> Self {
        let options = DerivationOptions::parse(&drv);
        let platform = if drv.is_builtin() { this_system } else { &drv.platform };
        let system_type = kiln_core::system_type(platform, &options.required_system_features);
        let now = Utc::now();
        Self {
            drv_path,
            drv,
            options,
            system_type,
            finished: AtomicBool::new(false),
            state: Mutex::new(StepState {
                created: false,
                deps: HashMap::new(),
                rdeps: Vec::new(),
                builds: Vec::new(),
                jobsets: Vec::new(),
                tries: 0,
                after: None,
                highest_global_priority: 0,
                highest_local_priority: 0,
                lowest_build_id: BuildId::MAX,
                runnable_since: now,
                last_supported: now,
            }),
        }
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// The platform this step must run on.
    pub fn platform<'a>(&'a self, this_system: &'a str) -> &'a str {
        if self.drv.is_builtin() {
            this_system
        } else {
            &self.drv.platform
        }
    }
}

/// Call `visitor` for `start` and every step in its dependency closure.
pub fn visit_dependencies(start: &Arc<Step>, mut visitor: impl FnMut(&Arc<Step>)) {
    let mut seen: HashSet<StorePath> = HashSet::new();
    let mut todo = vec![start.clone()];
    while let Some(step) = todo.pop() {
        if !seen.insert(step.drv_path.clone()) {
            continue;
        }
        visitor(&step);
        let state = step.state.lock();
        todo.extend(state.deps.values().cloned());
    }
}

/// Everything that transitively depends on `step`: the steps waiting on it
/// (including itself) and the builds whose top-level is among those steps.
pub fn get_dependents(step: &Arc<Step>) -> (Vec<Arc<Build>>, Vec<Arc<Step>>) {
    let mut steps: Vec<Arc<Step>> = Vec::new();
    let mut builds: Vec<Arc<Build>> = Vec::new();
    let mut seen_steps: HashSet<StorePath> = HashSet::new();
    let mut seen_builds: HashSet<BuildId> = HashSet::new();
    let mut todo = vec![step.clone()];
    while let Some(step) = todo.pop() {
        if !seen_steps.insert(step.drv_path.clone()) {
            continue;
        }
        let rdeps: Vec<Weak<Step>> = {
            let state = step.state.lock();
            for build in state.builds.iter().filter_map(Weak::upgrade) {
                if seen_builds.insert(build.id) {
                    builds.push(build);
                }
            }
            state.rdeps.clone()
        };
        steps.push(step);
        todo.extend(rdeps.iter().filter_map(Weak::upgrade));
    }
    (builds, steps)
}


#[cfg(test)]
mod tests {
    use super::testing::{link, make_step};
    use super::*;
    use std::collections::BTreeMap;

    fn make_build(id: i32, toplevel: &Arc<Step>) -> Arc<Build> {
        let build = Arc::new(Build::new(
            BuildId::new(id),
            toplevel.drv_path.clone(),
            BTreeMap::new(),
            kiln_core::JobsetId::new(1),
            "proj".into(),
            "js".into(),
            format!("job{id}"),
            0,
            3600,
            7200,
            10,
            0,
            Arc::new(Jobset::new(1)),
        ));
        build.set_toplevel(toplevel.clone());
        toplevel.state.lock().builds.push(Arc::downgrade(&build));
        build
    }

    #[test]
    fn dep_and_rdep_edges_mirror() {
        let a = make_step("a");
        let b = make_step("b");
        link(&a, &b);

        let a_state = a.state.lock();
        assert!(a_state.deps.contains_key(&b.drv_path));
        drop(a_state);
        let b_state = b.state.lock();
        let back = b_state.rdeps[0].upgrade().unwrap();
        assert!(Arc::ptr_eq(&back, &a));
    }

    #[test]
    fn visit_covers_closure_once() {
        // diamond: top -> {left, right} -> bottom
        let top = make_step("top");
        let left = make_step("left");
        let right = make_step("right");
        let bottom = make_step("bottom");
        link(&top, &left);
        link(&top, &right);
        link(&left, &bottom);
        link(&right, &bottom);

        let mut visited = Vec::new();
        visit_dependencies(&top, |s| visited.push(s.drv_path.clone()));
        assert_eq!(visited.len(), 4);
    }

    #[test]
    fn dependents_finds_builds_upward() {
        let top = make_step("top");
        let mid = make_step("mid");
        let leaf = make_step("leaf");
        link(&top, &mid);
        link(&mid, &leaf);
        let build = make_build(7, &top);

        let (builds, steps) = get_dependents(&leaf);
        assert_eq!(builds.len(), 1);
        assert!(Arc::ptr_eq(&builds[0], &build));
        assert_eq!(steps.len(), 3);
    }

    #[test]
    fn propagation_is_monotone() {
        let top = make_step("top");
        let leaf = make_step("leaf");
        link(&top, &leaf);
        let build = make_build(42, &top);

        build.propagate_priorities();
        {
            let state = leaf.state.lock();
            assert_eq!(state.highest_local_priority, 10);
            assert_eq!(state.highest_global_priority, 0);
            assert_eq!(state.lowest_build_id, BuildId::new(42));
            assert_eq!(state.jobsets.len(), 1);
        }

        build.set_global_priority(100);
        build.propagate_priorities();
        build.propagate_priorities();
        {
            let state = leaf.state.lock();
            assert_eq!(state.highest_global_priority, 100);
            // jobset inserted once despite repeated propagation
            assert_eq!(state.jobsets.len(), 1);
        }
    }

    #[test]
    fn builtin_steps_use_the_local_system() {
        let out = StorePath::derive("fetch", "fetch-out");
        let drv = Derivation {
            name: "fetch".into(),
            platform: "builtin".into(),
            builder: "builtin:fetchurl".into(),
            outputs: [("out".to_string(), out)].into_iter().collect(),
            ..Default::default()
        };
        let step = Step::new(StorePath::derive("fetch.drv", "f"), drv, "aarch64-darwin");
        assert_eq!(step.system_type, "aarch64-darwin");
    }
}
