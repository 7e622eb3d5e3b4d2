//! The queue monitor: reflects the database queue into the in-memory graph.

use crate::build::Build;
use crate::jobset::Jobset;
use crate::state::{GaugeGuard, Scheduler};
use crate::step::{get_dependents, Step};
use chrono::Utc;
use kiln_core::{BuildId, BuildStatus, JobsetId};
use kiln_db::models::BuildRow;
use kiln_db::{queries, DbError, QueueChange, QueueListener};
use kiln_store::{StoreError, StorePath};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for LoadError {
    fn from(e: sqlx::Error) -> Self {
        Self::Db(DbError::from(e))
    }
}

/// Reset step rows left busy by a previous runner instance. Called once at
/// startup, before any worker can allocate new rows.
pub async fn clear_busy_on_start(scheduler: &Scheduler) -> Result<u64, DbError> {
    let mut conn = scheduler.pool.acquire().await?;
    let cleared = queries::clear_busy(&mut *conn, Utc::now().timestamp()).await?;
    if cleared > 0 {
        info!(cleared, "reset stale busy build steps");
    }
    Ok(cleared)
}

/// The monitor task. A database error aborts the iteration; the monitor
/// backs off exponentially (bounded) and starts over.
pub async fn queue_monitor(scheduler: Arc<Scheduler>) {
    info!("queue monitor started");
    let mut backoff = 1u64;
    loop {
        match queue_monitor_loop(&scheduler).await {
            Ok(never) => match never {},
            Err(e) => {
                error!(error = %e, retry_in = backoff, "queue monitor iteration failed");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(scheduler.config.max_db_backoff.max(1));
            }
        }
    }
}

enum Never {}

async fn queue_monitor_loop(scheduler: &Arc<Scheduler>) -> Result<Never, DbError> {
    let mut listener = QueueListener::connect(&scheduler.pool).await?;
    let mut last_build_id = 0i32;
    loop {
        scheduler
            .counters
            .nr_queue_wakeups
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        sweep_orphaned_steps(scheduler).await?;
        get_queued_builds(scheduler, &mut last_build_id).await?;

        let poll = Duration::from_secs(scheduler.config.queue_poll_interval);
        tokio::select! {
            change = listener.recv() => match change? {
                QueueChange::BuildsAdded => {
                    info!("got notification: new builds added");
                }
                QueueChange::BuildsRestarted => {
                    info!("got notification: builds restarted");
                    last_build_id = 0;
                }
                QueueChange::BuildsCancelled
                | QueueChange::BuildsDeleted
                | QueueChange::BuildsBumped => {
                    process_queue_change(scheduler).await?;
                }
                QueueChange::JobsetSharesChanged => {
                    process_jobset_shares_change(scheduler).await?;
                }
                QueueChange::DumpStatus => {
                    crate::status::dump_status(scheduler).await?;
                }
            },
            _ = scheduler.queue_wake.wait_timeout(poll) => {}
        }
    }
}

/// Load pending builds the in-memory graph does not know yet, highest
/// global priority first, and expand each into steps.
async fn get_queued_builds(
    scheduler: &Arc<Scheduler>,
    last_build_id: &mut i32,
) -> Result<(), DbError> {
    let started = Instant::now();

    // Steps kept alive only by finished or deleted builds are gone now;
    // drop their index entries.
    scheduler
        .steps
        .lock()
        .retain(|_, weak| weak.strong_count() > 0);

    let rows = {
        let mut conn = scheduler.pool.acquire().await?;
        queries::get_pending_builds(&mut *conn, *last_build_id, scheduler.build_one).await?
    };

    // Derivations found fully valid are remembered for the whole pass so a
    // batch of builds sharing inputs probes each path once.
    let mut finished_drvs: BTreeSet<StorePath> = BTreeSet::new();
    let mut new_runnable: Vec<Arc<Step>> = Vec::new();

    for row in rows {
        let id = BuildId::new(row.id);
        *last_build_id = (*last_build_id).max(row.id);
        if scheduler.builds.lock().contains_key(&id) {
            continue;
        }
        scheduler
            .counters
            .nr_builds_read
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match load_build(scheduler, &row, &mut finished_drvs).await {
            Ok(mut runnable) => new_runnable.append(&mut runnable),
            Err(LoadError::Db(e)) => return Err(e),
            Err(LoadError::Store(e)) => {
                // The build is unloadable (e.g. its derivation is gone);
                // fail it rather than wedging the queue.
                warn!(build = row.id, error = %e, "marking unloadable build aborted");
                let now = Utc::now().timestamp();
                let mut conn = scheduler.pool.acquire().await?;
                queries::update_build(&mut *conn, id, BuildStatus::Aborted, now, now).await?;
                queries::notify_build_finished(&mut *conn, id, &[]).await?;
                scheduler.note_build_finished(id, BuildStatus::Aborted);
            }
        }
    }

    for step in &new_runnable {
        scheduler.make_runnable(step);
    }
    scheduler.counters.build_read_time_ms.fetch_add(
        started.elapsed().as_millis() as u64,
        std::sync::atomic::Ordering::Relaxed,
    );
    Ok(())
}

async fn load_build(
    scheduler: &Arc<Scheduler>,
    row: &BuildRow,
    finished_drvs: &mut BTreeSet<StorePath>,
) -> Result<Vec<Arc<Step>>, LoadError> {
    let drv_path = StorePath::new(row.drv_path.clone())?;
    let jobset = get_or_create_jobset(scheduler, &row.project, &row.jobset).await?;
    let build = Arc::new(Build::new(
        BuildId::new(row.id),
        drv_path,
        Default::default(),
        JobsetId::new(row.jobset_id),
        row.project.clone(),
        row.jobset.clone(),
        row.job.clone(),
        row.timestamp,
        row.max_silent_time,
        row.build_timeout,
        row.local_priority,
        row.global_priority,
        jobset,
    ));

    let result = crate::expand::expand_build(scheduler, &build, finished_drvs).await?;

    if !result.substitutions.is_empty() {
        let now = Utc::now().timestamp();
        let mut conn = scheduler.pool.acquire().await?;
        for substitution in &result.substitutions {
            for (output_name, store_path) in &substitution.outputs {
                queries::create_substitution_step(
                    &mut *conn,
                    build.id,
                    substitution.drv_path.as_str(),
                    output_name,
                    store_path.as_str(),
                    now,
                    now,
                )
                .await?;
            }
        }
    }

    match &result.toplevel {
        None => {
            mark_cached_build_done(scheduler, &build).await?;
            Ok(Vec::new())
        }
        Some(toplevel) => {
            info!(
                build = %build.id,
                job = %build.full_job_name(),
                drv = %toplevel.drv_path,
                steps = result.new_steps.len(),
                "loaded build"
            );
            Ok(result.new_runnable)
        }
    }
}

/// Every output of the build was already present in the destination store:
/// finish it without ever dispatching a machine.
async fn mark_cached_build_done(
    scheduler: &Arc<Scheduler>,
    build: &Arc<Build>,
) -> Result<(), LoadError> {
    let drv = scheduler.local_store.read_derivation(&build.drv_path).await?;
    let outputs: Vec<(String, String)> = drv
        .outputs
        .iter()
        .map(|(name, path)| (name.clone(), path.to_string()))
        .collect();
    let now = Utc::now().timestamp();

    {
        let _db = GaugeGuard::new(&scheduler.counters.nr_active_db_updates);
        let mut txn = scheduler.pool.begin().await.map_err(DbError::from)?;
        queries::update_build(&mut *txn, build.id, BuildStatus::Success, now, now).await?;
        queries::update_build_outputs(&mut *txn, build.id, &outputs).await?;
        queries::notify_build_finished(&mut *txn, build.id, &[]).await?;
        txn.commit().await.map_err(DbError::from)?;
    }
    build.mark_finished_in_db();
    scheduler
        .counters
        .nr_builds_done
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    scheduler.note_build_finished(build.id, BuildStatus::Success);
    info!(build = %build.id, "build succeeded from existing store paths");
    Ok(())
}

async fn get_or_create_jobset(
    scheduler: &Arc<Scheduler>,
    project: &str,
    jobset_name: &str,
) -> Result<Arc<Jobset>, DbError> {
    let key = (project.to_string(), jobset_name.to_string());
    if let Some(jobset) = scheduler.jobsets.lock().get(&key) {
        return Ok(jobset.clone());
    }

    let mut conn = scheduler.pool.acquire().await?;
    let shares = queries::get_jobset_shares(&mut *conn)
        .await?
        .into_iter()
        .find(|r| r.project == project && r.name == jobset_name)
        .map_or(1, |r| r.scheduling_shares.max(1) as u32);
    let jobset = Arc::new(Jobset::new(shares));

    // Seed the window with recent history so a restart does not grant
    // every jobset a clean slate.
    let now = Utc::now();
    let since = now.timestamp() - scheduler.config.scheduling_window;
    for (start, duration) in
        queries::get_jobset_step_times(&mut *conn, project, jobset_name, since).await?
    {
        jobset.add_step(now, start, duration.max(0), scheduler.config.scheduling_window);
    }

    Ok(scheduler
        .jobsets
        .lock()
        .entry(key)
        .or_insert(jobset)
        .clone())
}

/// Reconcile cancellations, deletions and priority bumps against the
/// database's view of unfinished builds.
async fn process_queue_change(scheduler: &Arc<Scheduler>) -> Result<(), DbError> {
    let rows = {
        let mut conn = scheduler.pool.acquire().await?;
        queries::get_build_priorities(&mut *conn).await?
    };
    let current: HashMap<i32, i32> = rows
        .into_iter()
        .map(|r| (r.id, r.global_priority))
        .collect();

    let mut bumped: Vec<Arc<Build>> = Vec::new();
    {
        let mut builds = scheduler.builds.lock();
        builds.retain(|id, build| match current.get(&id.as_i32()) {
            Some(&priority) => {
                if priority != build.global_priority() {
                    info!(build = %id, priority, "global priority changed");
                    build.set_global_priority(priority);
                    bumped.push(build.clone());
                }
                true
            }
            None => {
                info!(build = %id, "build cancelled or deleted externally");
                false
            }
        });
    }
    for build in bumped {
        build.propagate_priorities();
    }

    // Workers whose step serves no remaining build observe this flag at
    // their next poll point.
    let actives: Vec<_> = scheduler.active_steps.lock().clone();
    for active in actives {
        let (builds, _) = get_dependents(&active.step);
        if builds.is_empty() {
            info!(drv = %active.step.drv_path, "cancelling active step");
            active.cancel();
        }
    }

    scheduler.dispatcher_wake.wake();
    Ok(())
}

async fn process_jobset_shares_change(scheduler: &Arc<Scheduler>) -> Result<(), DbError> {
    let rows = {
        let mut conn = scheduler.pool.acquire().await?;
        queries::get_jobset_shares(&mut *conn).await?
    };
    let jobsets = scheduler.jobsets.lock();
    for row in rows {
        if let Some(jobset) = jobsets.get(&(row.project.clone(), row.name.clone())) {
            jobset.set_shares(row.scheduling_shares.max(1) as u32);
        }
    }
    Ok(())
}

/// Finalize step rows orphaned by database errors in workers.
async fn sweep_orphaned_steps(scheduler: &Arc<Scheduler>) -> Result<(), DbError> {
    let orphans: Vec<(BuildId, i32)> = scheduler.orphaned_steps.lock().iter().copied().collect();
    if orphans.is_empty() {
        return Ok(());
    }
    let now = Utc::now().timestamp();
    let mut conn = scheduler.pool.acquire().await?;
    for (build_id, step_nr) in &orphans {
        queries::abort_busy_step(&mut *conn, *build_id, *step_nr, now).await?;
    }
    let mut set = scheduler.orphaned_steps.lock();
    for orphan in &orphans {
        set.remove(orphan);
    }
    info!(count = orphans.len(), "cleared orphaned build steps");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::expand::testing::{make_build, seed_derivation};
    use crate::state::test_support::make_scheduler;

    #[tokio::test]
    async fn queue_change_reconciliation_drops_and_bumps() {
        let (scheduler, _, local, _) = make_scheduler(RunnerConfig::default());
        let (drv_a, _) = seed_derivation(&local, "a", &[]);
        let (drv_b, _) = seed_derivation(&local, "b", &[]);
        let build_a = make_build(1, &drv_a);
        let build_b = make_build(2, &drv_b);

        let mut finished = BTreeSet::new();
        crate::expand::expand_build(&scheduler, &build_a, &mut finished).await.unwrap();
        crate::expand::expand_build(&scheduler, &build_b, &mut finished).await.unwrap();
        assert_eq!(scheduler.builds.lock().len(), 2);

        // Mirror what process_queue_change does with the DB snapshot:
        // build 1 disappeared, build 2 got bumped.
        let current: HashMap<i32, i32> = [(2, 50)].into_iter().collect();
        let mut bumped = Vec::new();
        {
            let mut builds = scheduler.builds.lock();
            builds.retain(|id, build| match current.get(&id.as_i32()) {
                Some(&priority) => {
                    if priority != build.global_priority() {
                        build.set_global_priority(priority);
                        bumped.push(build.clone());
                    }
                    true
                }
                None => false,
            });
        }
        for build in &bumped {
            build.propagate_priorities();
        }

        assert_eq!(scheduler.builds.lock().len(), 1);
        assert_eq!(build_b.global_priority(), 50);
        let toplevel = build_b.toplevel().unwrap();
        assert_eq!(toplevel.state.lock().highest_global_priority, 50);

        // Once the last handle on the dropped build goes away its step
        // serves nobody, which is what triggers cancellation of workers.
        let top_a = build_a.toplevel().unwrap();
        drop(build_a);
        let (builds, _) = get_dependents(&top_a);
        assert!(builds.is_empty());
    }

    #[tokio::test]
    async fn cancelling_orphan_actives() {
        let (scheduler, _, local, _) = make_scheduler(RunnerConfig::default());
        let (drv, _) = seed_derivation(&local, "c", &[]);
        let build = make_build(3, &drv);
        let mut finished = BTreeSet::new();
        let result = crate::expand::expand_build(&scheduler, &build, &mut finished).await.unwrap();
        let step = result.toplevel.unwrap();

        let active = Arc::new(crate::state::ActiveStep::new(step.clone()));
        scheduler.register_active(active.clone());

        // Simulate the build being deleted: drop it from the registry and
        // release our handles, then run the active-step sweep.
        scheduler.builds.lock().clear();
        drop(build);

        let actives: Vec<_> = scheduler.active_steps.lock().clone();
        for a in actives {
            let (builds, _) = get_dependents(&a.step);
            if builds.is_empty() {
                a.cancel();
            }
        }
        assert!(active.cancelled());
    }
}
