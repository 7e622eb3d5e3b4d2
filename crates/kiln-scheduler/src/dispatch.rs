//! The dispatcher: pairing runnable steps with machines.

use crate::builder;
use crate::machine::Machine;
use crate::state::{MachineReservation, Scheduler};
use crate::step::Step;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kiln_core::{BuildId, BuildStatus, RemoteResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Snapshot of a runnable step's scheduling key, taken once per dispatch
/// pass so sorting does not re-lock step state.
pub struct StepInfo {
    pub step: Arc<Step>,
    pub after: Option<DateTime<Utc>>,
    /// Minimum `share_used` over the step's jobsets.
    pub lowest_share_used: f64,
    pub highest_global_priority: i32,
    pub highest_local_priority: i32,
    pub lowest_build_id: BuildId,
    pub runnable_since: DateTime<Utc>,
}

impl StepInfo {
    pub fn new(step: Arc<Step>) -> Self {
        let state = step.state.lock();
        let lowest_share_used = state
            .jobsets
            .iter()
            .map(|j| j.share_used())
            .fold(f64::INFINITY, f64::min);
        let info = Self {
            after: state.after,
            lowest_share_used,
            highest_global_priority: state.highest_global_priority,
            highest_local_priority: state.highest_local_priority,
            lowest_build_id: state.lowest_build_id,
            runnable_since: state.runnable_since,
            step: step.clone(),
        };
        drop(state);
        info
    }
}

/// Order candidates by the selection policy: fair share first, then global
/// priority, local priority, and build age.
pub fn sort_candidates(infos: &mut [StepInfo]) {
    infos.sort_by(|a, b| {
        a.lowest_share_used
            .partial_cmp(&b.lowest_share_used)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.highest_global_priority.cmp(&a.highest_global_priority))
            .then(b.highest_local_priority.cmp(&a.highest_local_priority))
            .then(a.lowest_build_id.cmp(&b.lowest_build_id))
    });
}

/// Choose a machine for `step`: least loaded, then fastest, then longest
/// idle. Only machines with a free slot that support the step and are not
/// in backoff qualify.
pub fn pick_machine(
    machines: &[Arc<Machine>],
    this_system: &str,
    step: &Step,
    now: DateTime<Utc>,
) -> Option<Arc<Machine>> {
    machines
        .iter()
        .filter(|m| m.current_jobs() < m.max_jobs)
        .filter(|m| m.available(now))
        .filter(|m| m.supports_step(this_system, step))
        .min_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.speed_factor
                        .partial_cmp(&a.speed_factor)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(
                    a.state
                        .idle_since
                        .load(Ordering::SeqCst)
                        .cmp(&b.state.idle_since.load(Ordering::SeqCst)),
                )
        })
        .cloned()
}

/// The dispatcher task. Wakes on demand (new runnable steps, freed machine
/// slots, machine reloads) and otherwise sits out the idle interval or the
/// earliest deferred retry, whichever is sooner.
pub async fn dispatcher(scheduler: Arc<Scheduler>) {
    info!("dispatcher started");
    loop {
        scheduler
            .counters
            .nr_dispatcher_wakeups
            .fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let earliest_deferred = do_dispatch(&scheduler).await;
        scheduler
            .counters
            .dispatch_time_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        let idle = Duration::from_secs(scheduler.config.dispatch_idle_interval);
        let timeout = earliest_deferred
            .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .map_or(idle, |d| d.min(idle));
        scheduler.dispatcher_wake.wait_timeout(timeout).await;
    }
}

/// One dispatch pass. Returns the earliest `after` of a deferred step, if
/// any, so the caller can time its next wait.
pub async fn do_dispatch(scheduler: &Arc<Scheduler>) -> Option<DateTime<Utc>> {
    let now = Utc::now();

    // Consistent snapshot of runnable steps, pruning dead references.
    let steps: Vec<Arc<Step>> = {
        let mut runnable = scheduler.runnable.lock();
        runnable.retain(|weak| weak.strong_count() > 0);
        runnable.iter().filter_map(std::sync::Weak::upgrade).collect()
    };
    let machines: Vec<Arc<Machine>> = scheduler.machines.lock().values().cloned().collect();

    let unsupported = age_unsupported(scheduler, &steps, &machines, now);
    for step in unsupported {
        abort_unsupported_step(scheduler, step).await;
    }

    let mut earliest_deferred: Option<DateTime<Utc>> = None;
    let mut infos: Vec<StepInfo> = Vec::new();
    for step in steps {
        if step.finished() {
            continue;
        }
        let info = StepInfo::new(step);
        match info.after {
            Some(after) if after > now => {
                earliest_deferred =
                    Some(earliest_deferred.map_or(after, |cur: DateTime<Utc>| cur.min(after)));
            }
            _ => infos.push(info),
        }
    }

    update_machine_type_stats(scheduler, &infos, now);
    sort_candidates(&mut infos);

    for info in infos {
        let Some(machine) = pick_machine(&machines, &scheduler.config.this_system, &info.step, now)
        else {
            continue;
        };
        let Some(reservation) =
            MachineReservation::try_new(scheduler.clone(), info.step.clone(), machine.clone())
        else {
            continue;
        };

        // The step leaves the runnable list while a worker holds it.
        scheduler.runnable.lock().retain(|weak| {
            weak.upgrade().map_or(false, |s| !Arc::ptr_eq(&s, &info.step))
        });
        {
            let mut types = scheduler.machine_types.lock();
            if let Some(stats) = types.get_mut(&info.step.system_type) {
                stats.runnable = stats.runnable.saturating_sub(1);
                stats.wait_time_secs += (now - info.runnable_since).num_seconds().max(0);
            }
        }
        info!(
            drv = %info.step.drv_path,
            machine = %machine.store_uri,
            system = %info.step.system_type,
            "dispatching step"
        );
        tokio::spawn(builder::builder(scheduler.clone(), reservation));
    }

    earliest_deferred
}

/// Track when each runnable step last had a capable machine. Returns the
/// steps that have been unsupported for longer than the configured bound.
fn age_unsupported(
    scheduler: &Scheduler,
    steps: &[Arc<Step>],
    machines: &[Arc<Machine>],
    now: DateTime<Utc>,
) -> Vec<Arc<Step>> {
    let max_unsupported = scheduler.config.max_unsupported_time;
    let mut expired = Vec::new();
    for step in steps {
        let supported = machines
            .iter()
            .any(|m| m.supports_step(&scheduler.config.this_system, step));
        let mut state = step.state.lock();
        if supported {
            state.last_supported = now;
        } else if max_unsupported > 0
            && now - state.last_supported > ChronoDuration::seconds(max_unsupported as i64)
        {
            expired.push(step.clone());
        }
    }
    expired
}

async fn abort_unsupported_step(scheduler: &Arc<Scheduler>, step: Arc<Step>) {
    scheduler
        .counters
        .nr_unsupported_steps
        .fetch_add(1, Ordering::Relaxed);
    scheduler
        .runnable
        .lock()
        .retain(|weak| weak.upgrade().map_or(false, |s| !Arc::ptr_eq(&s, &step)));

    let result = RemoteResult {
        step_status: BuildStatus::Unsupported,
        error_msg: format!("no machine supports system type '{}'", step.system_type),
        start_time: Some(Utc::now()),
        stop_time: Some(Utc::now()),
        ..Default::default()
    };
    if let Err(e) = builder::fail_step(scheduler, &step, &result, None).await {
        error!(drv = %step.drv_path, error = %e, "failed to abort unsupported step");
    }
}

fn update_machine_type_stats(scheduler: &Scheduler, infos: &[StepInfo], now: DateTime<Utc>) {
    let mut types = scheduler.machine_types.lock();
    for stats in types.values_mut() {
        stats.runnable = 0;
    }
    for info in infos {
        let stats = types.entry(info.step.system_type.clone()).or_default();
        stats.runnable += 1;
        if stats.last_active.is_none() {
            stats.last_active = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::jobset::Jobset;
    use crate::machine::parse_machines;
    use crate::state::test_support::{install_machines, make_scheduler};
    use crate::step::testing::make_step;

    fn with_jobset(step: &Arc<Step>, jobset: &Arc<Jobset>) {
        step.state.lock().jobsets.push(jobset.clone());
    }

    fn with_priorities(step: &Arc<Step>, global: i32, local: i32, build_id: i32) {
        let mut state = step.state.lock();
        state.highest_global_priority = global;
        state.highest_local_priority = local;
        state.lowest_build_id = BuildId::new(build_id);
    }

    #[test]
    fn fair_share_wins_over_priority() {
        let hot = Arc::new(Jobset::new(1));
        hot.add_step(Utc::now(), Utc::now().timestamp(), 1000, 86400);
        let cold = Arc::new(Jobset::new(1));

        let a = make_step("a");
        with_jobset(&a, &hot);
        with_priorities(&a, 100, 100, 1);
        let b = make_step("b");
        with_jobset(&b, &cold);
        with_priorities(&b, 0, 0, 2);

        let mut infos = vec![StepInfo::new(a), StepInfo::new(b.clone())];
        sort_candidates(&mut infos);
        assert!(Arc::ptr_eq(&infos[0].step, &b));
    }

    #[test]
    fn priority_orders_within_equal_share() {
        let jobset = Arc::new(Jobset::new(1));
        let low = make_step("low");
        with_jobset(&low, &jobset);
        with_priorities(&low, 0, 5, 1);
        let bumped = make_step("bumped");
        with_jobset(&bumped, &jobset);
        with_priorities(&bumped, 10, 0, 9);
        let old = make_step("old");
        with_jobset(&old, &jobset);
        with_priorities(&old, 0, 5, 3);

        let mut infos = vec![
            StepInfo::new(old.clone()),
            StepInfo::new(low.clone()),
            StepInfo::new(bumped.clone()),
        ];
        sort_candidates(&mut infos);
        // bumped global priority first; then local priority ties broken by
        // lower build id
        assert!(Arc::ptr_eq(&infos[0].step, &bumped));
        assert!(Arc::ptr_eq(&infos[1].step, &low));
        assert!(Arc::ptr_eq(&infos[2].step, &old));
    }

    #[test]
    fn bumped_build_preempts_backlog() {
        // One hundred queued steps at default priority, one bumped.
        let jobset = Arc::new(Jobset::new(1));
        let mut infos = Vec::new();
        for i in 2..102 {
            let step = make_step(&format!("s{i}"));
            with_jobset(&step, &jobset);
            with_priorities(&step, 0, 0, i);
            infos.push(StepInfo::new(step));
        }
        let target = make_step("target");
        with_jobset(&target, &jobset);
        with_priorities(&target, 100, 0, 1000);
        infos.push(StepInfo::new(target.clone()));

        sort_candidates(&mut infos);
        assert!(Arc::ptr_eq(&infos[0].step, &target));
    }

    #[test]
    fn machine_choice_prefers_low_load_then_speed_then_idle() {
        let machines: Vec<Arc<Machine>> = parse_machines(
            "mem://busy x86_64-linux - 4 8\n\
             mem://fast x86_64-linux - 4 8\n\
             mem://slow x86_64-linux - 4 1\n",
        )
        .into_iter()
        .map(Arc::new)
        .collect();
        machines[0].state.current_jobs.store(2, Ordering::SeqCst);
        machines[1].state.idle_since.store(100, Ordering::SeqCst);
        machines[2].state.idle_since.store(50, Ordering::SeqCst);

        let step = make_step("s");
        let now = Utc::now();
        let picked = pick_machine(&machines, "x86_64-linux", &step, now).unwrap();
        // equal (zero) load: fastest wins
        assert_eq!(picked.store_uri, "mem://fast");

        machines[1].state.current_jobs.store(4, Ordering::SeqCst);
        let picked = pick_machine(&machines, "x86_64-linux", &step, now).unwrap();
        assert_eq!(picked.store_uri, "mem://slow");
    }

    #[test]
    fn machines_in_backoff_are_not_picked() {
        let machines: Vec<Arc<Machine>> =
            parse_machines("mem://m x86_64-linux").into_iter().map(Arc::new).collect();
        let step = make_step("s");
        let now = Utc::now();
        assert!(pick_machine(&machines, "x86_64-linux", &step, now).is_some());

        machines[0].state.note_failure(now, 30, 7);
        assert!(pick_machine(&machines, "x86_64-linux", &step, now).is_none());

        machines[0].state.note_success();
        assert!(pick_machine(&machines, "x86_64-linux", &step, now).is_some());
    }

    #[test]
    fn fair_share_ratio_over_sequential_dispatches() {
        // Jobsets A (1 share) and B (3 shares) each queue 10 steps for a
        // single one-slot machine; after four dispatches the executed ratio
        // is 1:3.
        let jobset_a = Arc::new(Jobset::new(1));
        let jobset_b = Arc::new(Jobset::new(3));
        let mut steps = Vec::new();
        for i in 0..10 {
            let a = make_step(&format!("a{i}"));
            with_jobset(&a, &jobset_a);
            with_priorities(&a, 0, 0, 100 + i);
            steps.push(("A", a));
            let b = make_step(&format!("b{i}"));
            with_jobset(&b, &jobset_b);
            with_priorities(&b, 0, 0, 200 + i);
            steps.push(("B", b));
        }

        let mut executed_a = 0;
        let mut executed_b = 0;
        let now = Utc::now();
        for round in 0..4 {
            let mut infos: Vec<StepInfo> = steps
                .iter()
                .map(|(_, s)| StepInfo::new(s.clone()))
                .collect();
            sort_candidates(&mut infos);
            let winner = &infos[0].step;
            let (owner, idx) = steps
                .iter()
                .enumerate()
                .find_map(|(i, (o, s))| Arc::ptr_eq(s, winner).then_some((*o, i)))
                .unwrap();
            // each step runs for 100 seconds on the single slot
            let start = now.timestamp() + round * 100;
            match owner {
                "A" => {
                    executed_a += 1;
                    jobset_a.add_step(now, start, 100, 86400);
                }
                _ => {
                    executed_b += 1;
                    jobset_b.add_step(now, start, 100, 86400);
                }
            }
            steps.remove(idx);
        }
        assert_eq!(executed_a, 1);
        assert_eq!(executed_b, 3);
    }

    #[tokio::test]
    async fn deferred_steps_report_their_wakeup() {
        let (scheduler, _, _, _) = make_scheduler(RunnerConfig::default());
        install_machines(&scheduler, "mem://m x86_64-linux");
        let step = make_step("later");
        let after = Utc::now() + ChronoDuration::seconds(300);
        {
            let mut state = step.state.lock();
            state.created = true;
            state.after = Some(after);
        }
        scheduler.make_runnable(&step);
        // make_runnable refreshed runnable_since, restore after
        step.state.lock().after = Some(after);

        let earliest = do_dispatch(&scheduler).await;
        assert_eq!(earliest, Some(after));
        // still runnable, not dispatched
        assert_eq!(scheduler.runnable.lock().len(), 1);
    }

    #[tokio::test]
    async fn unsupported_aging_tracks_capable_machines() {
        let mut config = RunnerConfig::default();
        config.max_unsupported_time = 60;
        let (scheduler, _, _, _) = make_scheduler(config);
        install_machines(&scheduler, "mem://m x86_64-linux");

        let step = make_step("s");
        let old = Utc::now() - ChronoDuration::seconds(3600);
        step.state.lock().last_supported = old;

        let machines: Vec<Arc<Machine>> = scheduler.machines.lock().values().cloned().collect();
        // a capable machine exists: the clock resets
        let expired = age_unsupported(&scheduler, &[step.clone()], &machines, Utc::now());
        assert!(expired.is_empty());
        assert!(step.state.lock().last_supported > old);

        // no capable machine and the bound has long passed
        step.state.lock().last_supported = old;
        let expired = age_unsupported(&scheduler, &[step.clone()], &[], Utc::now());
        assert_eq!(expired.len(), 1);

        // bound of zero disables the rule
        let mut config = RunnerConfig::default();
        config.max_unsupported_time = 0;
        let (scheduler, _, _, _) = make_scheduler(config);
        step.state.lock().last_supported = old;
        let expired = age_unsupported(&scheduler, &[step.clone()], &[], Utc::now());
        assert!(expired.is_empty());
    }
}
