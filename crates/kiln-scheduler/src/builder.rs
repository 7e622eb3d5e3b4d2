//! Builder workers: execute one step on one machine.

use crate::machine::Machine;
use crate::state::{ActiveStep, GaugeGuard, MachineReservation, Scheduler};
use crate::step::{get_dependents, Step};
use chrono::{Duration as ChronoDuration, Utc};
use kiln_core::{BuildId, BuildStatus, RemoteResult, StepNr, StepPhase};
use kiln_db::{queries, DbError};
use kiln_store::{compute_closure, BuildClient, BuildOptions, Nar, PathInfo, StoreError, StorePath};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcome of one step execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Terminal: the step succeeded or failed for good and was removed.
    Done,
    /// Transient trouble; run the step again. `backoff` schedules the next
    /// attempt with geometric delay, a bare requeue retries immediately.
    Retry { backoff: bool },
    /// A cancellation request was observed mid-flight.
    MaybeCancelled,
}

/// Early exits of the step protocol that are not step failures.
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("step cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for StepError {
    fn from(e: sqlx::Error) -> Self {
        Self::Db(DbError::from(e))
    }
}

/// One worker: runs the reserved step to completion, then releases the
/// machine slot and performs retry/cancellation bookkeeping.
pub async fn builder(scheduler: Arc<Scheduler>, reservation: MachineReservation) {
    scheduler
        .counters
        .nr_steps_started
        .fetch_add(1, Ordering::Relaxed);
    let step = reservation.step.clone();
    let active = Arc::new(ActiveStep::new(step.clone()));
    scheduler.register_active(active.clone());

    let outcome = do_build_step(&scheduler, &reservation, &active).await;

    scheduler.deregister_active(&active);
    // Free the machine slot (and wake the dispatcher) before requeueing, so
    // the step is never simultaneously runnable and held.
    drop(reservation);

    match outcome {
        StepOutcome::Done => {}
        StepOutcome::Retry { backoff } => {
            if backoff {
                let (tries, after) = {
                    let mut state = step.state.lock();
                    state.tries += 1;
                    let delay = scheduler.config.retry_delay(state.tries);
                    let after = Utc::now()
                        + ChronoDuration::milliseconds(delay.as_millis() as i64);
                    state.after = Some(after);
                    (state.tries, after)
                };
                scheduler.counters.nr_retries.fetch_add(1, Ordering::Relaxed);
                scheduler
                    .counters
                    .max_nr_retries
                    .fetch_max(tries as u64, Ordering::Relaxed);
                info!(drv = %step.drv_path, tries, after = %after, "step will be retried");
            }
            scheduler.make_runnable(&step);
        }
        StepOutcome::MaybeCancelled => {
            resolve_maybe_cancelled(&scheduler, &step);
        }
    }
}

/// Decide what a cancellation observation means: if builds still need the
/// step the request was aimed at another build and the step is requeued;
/// otherwise the step is dropped. Returns true when requeued.
pub(crate) fn resolve_maybe_cancelled(scheduler: &Arc<Scheduler>, step: &Arc<Step>) -> bool {
    let (builds, _) = get_dependents(step);
    if builds.is_empty() {
        info!(drv = %step.drv_path, "step cancelled");
        step.mark_finished();
        scheduler.forget_step(&step.drv_path);
        false
    } else {
        debug!(drv = %step.drv_path, "cancellation was for another build; requeueing");
        scheduler.make_runnable(step);
        true
    }
}

async fn do_build_step(
    scheduler: &Arc<Scheduler>,
    reservation: &MachineReservation,
    active: &Arc<ActiveStep>,
) -> StepOutcome {
    let step = &reservation.step;
    let machine = &reservation.machine;
    let mut result = RemoteResult {
        start_time: Some(Utc::now()),
        ..Default::default()
    };
    let mut row: Option<(BuildId, StepNr)> = None;

    match run_step(scheduler, step, machine, active, &mut result, &mut row).await {
        Ok(outcome) => outcome,
        Err(StepError::Cancelled) => {
            if let Some((build_id, step_nr)) = row {
                // Best effort; the row also gets swept by clear_busy on the
                // next runner start.
                if let Ok(mut conn) = scheduler.pool.acquire().await {
                    let _ = queries::abort_busy_step(
                        &mut *conn,
                        build_id,
                        step_nr,
                        Utc::now().timestamp(),
                    )
                    .await;
                }
            }
            StepOutcome::MaybeCancelled
        }
        Err(StepError::Db(e)) => {
            warn!(drv = %step.drv_path, error = %e, "database error during step; step kept busy");
            if let Some(row) = row {
                scheduler.orphaned_steps.lock().insert(row);
            }
            StepOutcome::Retry { backoff: true }
        }
    }
}

async fn run_step(
    scheduler: &Arc<Scheduler>,
    step: &Arc<Step>,
    machine: &Arc<Machine>,
    active: &Arc<ActiveStep>,
    result: &mut RemoteResult,
    row: &mut Option<(BuildId, StepNr)>,
) -> Result<StepOutcome, StepError> {
    let config = &scheduler.config;
    let counters = &scheduler.counters;

    let (dependents, _) = get_dependents(step);
    if dependents.is_empty() {
        // Every referencing build disappeared while we were queued.
        step.mark_finished();
        scheduler.forget_step(&step.drv_path);
        return Ok(StepOutcome::Done);
    }
    let build = representative_build(&dependents, scheduler.build_one);

    // A failure of the same derivation may be on record; if so the step is
    // over before any machine is involved.
    if step.options.allow_cached_failure {
        let paths: Vec<String> = step.drv.outputs.values().map(|p| p.to_string()).collect();
        let mut conn = scheduler.pool.acquire().await?;
        if queries::check_cached_failure(&mut *conn, &paths).await? {
            info!(drv = %step.drv_path, "failing step due to cached failure");
            result.step_status = BuildStatus::CachedFailure;
            result.error_msg = "cached failure".into();
            result.stop_time = Some(Utc::now());
            let step_nr = queries::create_build_step(
                &mut *conn,
                result.start_time.map(|t| t.timestamp()),
                build.id,
                step.drv_path.as_str(),
                &step.system_type,
                BuildStatus::CachedFailure,
                "",
                Some("cached failure"),
                None,
            )
            .await?;
            *row = Some((build.id, step_nr));
            drop(conn);
            fail_step(scheduler, step, result, Some(build.id)).await?;
            return Ok(StepOutcome::Done);
        }
    }

    // Allocate the step row and announce builds entering execution.
    let step_nr = {
        let mut conn = scheduler.pool.acquire().await?;
        let step_nr = queries::create_build_step(
            &mut *conn,
            result.start_time.map(|t| t.timestamp()),
            build.id,
            step.drv_path.as_str(),
            &step.system_type,
            BuildStatus::Busy,
            &machine.store_uri,
            None,
            None,
        )
        .await?;
        for b in &dependents {
            let is_toplevel = b.toplevel().is_some_and(|t| Arc::ptr_eq(&t, step));
            if is_toplevel && b.mark_started() {
                queries::notify_build_started(&mut *conn, b.id).await?;
            }
        }
        step_nr
    };
    *row = Some((build.id, step_nr));
    ensure_not_cancelled(active)?;

    update_phase(scheduler, build.id, step_nr, StepPhase::Connecting).await?;
    let client = match scheduler.connector.connect(&machine.store_uri).await {
        Ok(client) => client,
        Err(e) => {
            return remote_failure(scheduler, step, machine, build.id, step_nr, result, e).await;
        }
    };
    ensure_not_cancelled(active)?;

    // Upload the missing part of the input closure. Uploads to one machine
    // are serialized by its send lock; a bounded number run process-wide.
    update_phase(scheduler, build.id, step_nr, StepPhase::SendingInputs).await?;
    let send_lock = machine.state.send_lock.clone();
    let send_guard =
        match tokio::time::timeout(config.send_lock_timeout(), send_lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                info!(machine = %machine.store_uri, drv = %step.drv_path,
                      "send lock busy; requeueing step");
                let mut conn = scheduler.pool.acquire().await?;
                queries::abort_busy_step(&mut *conn, build.id, step_nr, Utc::now().timestamp())
                    .await?;
                return Ok(StepOutcome::Retry { backoff: false });
            }
        };
    let copy_started = Instant::now();
    {
        let _copying = GaugeGuard::new(&counters.nr_steps_copying_to);
        let _permit = scheduler
            .copy_closure_throttle
            .acquire()
            .await
            .expect("copy closure throttle closed");
        match transfer_inputs(scheduler, client.as_ref(), step).await {
            Ok(bytes) => {
                counters.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            }
            Err(e) => {
                drop(send_guard);
                return remote_failure(scheduler, step, machine, build.id, step_nr, result, e)
                    .await;
            }
        }
    }
    drop(send_guard);
    result.overhead = copy_started.elapsed().as_secs() as u32;
    ensure_not_cancelled(active)?;

    update_phase(scheduler, build.id, step_nr, StepPhase::Building).await?;
    let repeats = dependents
        .iter()
        .map(|b| config.repeats_for(&b.project_name, &b.jobset_name))
        .max()
        .unwrap_or(1);
    let options = BuildOptions {
        max_silent_time: build.max_silent_time,
        build_timeout: build.build_timeout,
        max_log_size: config.max_log_size,
        repeats,
        enforce_determinism: repeats > 1,
    };
    {
        let _building = GaugeGuard::new(&counters.nr_steps_building);
        match client
            .build_derivation(&step.drv_path, &step.drv, &options)
            .await
        {
            Ok(remote) => {
                machine.state.note_success();
                result.update_with(&remote);
            }
            Err(e) => {
                return remote_failure(scheduler, step, machine, build.id, step_nr, result, e)
                    .await;
            }
        }
    }
    ensure_not_cancelled(active)?;

    if result.step_status != BuildStatus::Success {
        return step_failed(scheduler, step, machine, build.id, step_nr, result).await;
    }

    update_phase(scheduler, build.id, step_nr, StepPhase::ReceivingOutputs).await?;
    {
        let _fetching = GaugeGuard::new(&counters.nr_steps_copying_from);
        match fetch_outputs(scheduler, client.as_ref(), step).await {
            Ok(bytes) => {
                counters.bytes_received.fetch_add(bytes, Ordering::Relaxed);
            }
            Err(e @ StoreError::NarTooLarge { .. }) => {
                result.step_status = BuildStatus::NarSizeLimitExceeded;
                result.error_msg = e.to_string();
                result.can_retry = false;
                return step_failed(scheduler, step, machine, build.id, step_nr, result).await;
            }
            Err(e) => {
                return remote_failure(scheduler, step, machine, build.id, step_nr, result, e)
                    .await;
            }
        }
    }
    ensure_not_cancelled(active)?;

    update_phase(scheduler, build.id, step_nr, StepPhase::WaitingForLocalSlot).await?;
    {
        let _waiting = GaugeGuard::new(&counters.nr_steps_waiting);
        let _slot = scheduler
            .local_work_throttle
            .acquire()
            .await
            .expect("local work throttle closed");
        update_phase(scheduler, build.id, step_nr, StepPhase::PostProcessing).await?;
        post_process(scheduler, step).await;
    }

    if result.stop_time.is_none() {
        result.stop_time = Some(Utc::now());
    }
    finish_success(scheduler, step, machine, build.id, step_nr, result).await?;
    Ok(StepOutcome::Done)
}

fn ensure_not_cancelled(active: &ActiveStep) -> Result<(), StepError> {
    if active.cancelled() {
        Err(StepError::Cancelled)
    } else {
        Ok(())
    }
}

async fn update_phase(
    scheduler: &Scheduler,
    build_id: BuildId,
    step_nr: StepNr,
    phase: StepPhase,
) -> Result<(), StepError> {
    let mut conn = scheduler.pool.acquire().await?;
    queries::update_build_step(&mut *conn, build_id, step_nr, phase).await?;
    Ok(())
}

/// The build whose identity (timeouts, `build_started`) this execution
/// runs under. A `--build-one` target wins; otherwise the oldest build.
fn representative_build(dependents: &[Arc<crate::build::Build>], build_one: Option<BuildId>) -> Arc<crate::build::Build> {
    if let Some(target) = build_one {
        if let Some(build) = dependents.iter().find(|b| b.id == target) {
            return build.clone();
        }
    }
    dependents
        .iter()
        .min_by_key(|b| b.id)
        .cloned()
        .expect("dependents is non-empty")
}

/// Copy the part of the step's input closure the machine is missing.
/// Sources live in the local store; outputs of dependency steps have been
/// registered in the destination store by the workers that built them.
pub(crate) async fn transfer_inputs(
    scheduler: &Scheduler,
    client: &dyn BuildClient,
    step: &Arc<Step>,
) -> Result<u64, StoreError> {
    let mut roots: BTreeSet<StorePath> = step.drv.input_srcs.clone();
    for (input_drv, wanted_outputs) in &step.drv.input_drvs {
        let drv = scheduler.local_store.read_derivation(input_drv).await?;
        for name in wanted_outputs {
            if let Some(path) = drv.outputs.get(name) {
                roots.insert(path.clone());
            }
        }
    }

    // Closure over both stores: dependency outputs resolve in the
    // destination store, sources in the local store.
    let closure = compute_closure(
        &[scheduler.dest_store.as_ref(), scheduler.local_store.as_ref()],
        roots,
    )
    .await?;

    let valid = client.query_valid_paths(&closure).await?;
    let mut bytes = 0;
    for path in &closure {
        if valid.contains(path) {
            continue;
        }
        let (info, nar) = read_path(scheduler, path).await?;
        bytes += nar.size();
        client.add_to_store(info, nar).await?;
    }
    Ok(bytes)
}

async fn read_path(scheduler: &Scheduler, path: &StorePath) -> Result<(PathInfo, Nar), StoreError> {
    if let Some(info) = scheduler.dest_store.query_path_info(path).await? {
        let nar = scheduler.dest_store.nar_from_path(path).await?;
        return Ok((info, nar));
    }
    if let Some(info) = scheduler.local_store.query_path_info(path).await? {
        let nar = scheduler.local_store.nar_from_path(path).await?;
        return Ok((info, nar));
    }
    Err(StoreError::PathNotValid(path.to_string()))
}

/// Download the step's outputs into the destination store, enforcing the
/// output size limit across all outputs together.
pub(crate) async fn fetch_outputs(
    scheduler: &Scheduler,
    client: &dyn BuildClient,
    step: &Arc<Step>,
) -> Result<u64, StoreError> {
    let limit = scheduler.config.max_output_size;
    let mut total = 0u64;
    for path in step.drv.outputs.values() {
        let nar = client.nar_from_path(path).await?;
        total += nar.size();
        if total > limit {
            return Err(StoreError::NarTooLarge { size: total, limit });
        }
        let info = PathInfo {
            path: path.clone(),
            nar_size: nar.size(),
            references: BTreeSet::new(),
            deriver: Some(step.drv_path.clone()),
        };
        scheduler.dest_store.add_to_store(info, nar).await?;
    }
    Ok(total)
}

/// CPU-bound tail work: index the NAR member listing and pin outputs with
/// GC roots. Never fails the step; problems here are logged and moved past.
async fn post_process(scheduler: &Scheduler, step: &Arc<Step>) {
    for path in step.drv.outputs.values() {
        match scheduler.dest_store.nar_from_path(path).await {
            Ok(nar) => match nar.members() {
                Ok(members) => {
                    debug!(path = %path, members = members.len(), "indexed output")
                }
                Err(e) => warn!(path = %path, error = %e, "could not index output NAR"),
            },
            Err(e) => warn!(path = %path, error = %e, "could not re-read output"),
        }
        if let Err(e) = scheduler.add_root(path).await {
            warn!(path = %path, error = %e, "could not register GC root");
        }
    }
}

/// Transport-level trouble with the machine: put it in backoff and treat
/// the attempt as aborted (retriable if the error was transport-shaped).
async fn remote_failure(
    scheduler: &Arc<Scheduler>,
    step: &Arc<Step>,
    machine: &Arc<Machine>,
    build_id: BuildId,
    step_nr: StepNr,
    result: &mut RemoteResult,
    error: StoreError,
) -> Result<StepOutcome, StepError> {
    warn!(
        drv = %step.drv_path,
        machine = %machine.store_uri,
        error = %error,
        "remote failure during step"
    );
    if error.is_transport() {
        machine.state.note_failure(
            Utc::now(),
            scheduler.config.machine_base_cooldown,
            scheduler.config.machine_max_backoff_exp,
        );
    }
    result.step_status = BuildStatus::Aborted;
    result.can_retry = error.is_transport();
    result.error_msg = error.to_string();
    result.stop_time = Some(Utc::now());
    step_failed(scheduler, step, machine, build_id, step_nr, result).await
}

/// Record a failed attempt and decide between retry and permanent failure.
async fn step_failed(
    scheduler: &Arc<Scheduler>,
    step: &Arc<Step>,
    machine: &Arc<Machine>,
    build_id: BuildId,
    step_nr: StepNr,
    result: &mut RemoteResult,
) -> Result<StepOutcome, StepError> {
    if result.stop_time.is_none() {
        result.stop_time = Some(Utc::now());
    }
    {
        let _db = GaugeGuard::new(&scheduler.counters.nr_active_db_updates);
        let mut conn = scheduler.pool.acquire().await?;
        queries::finish_build_step(&mut *conn, build_id, step_nr, result, &machine.store_uri)
            .await?;
        queries::notify_step_finished(&mut *conn, build_id, step_nr, "").await?;
    }

    if result.can_retry {
        let tries = step.state.lock().tries;
        if tries + 1 <= scheduler.config.max_tries {
            return Ok(StepOutcome::Retry { backoff: true });
        }
    }
    fail_step(scheduler, step, result, Some(build_id)).await?;
    Ok(StepOutcome::Done)
}

/// Fail the step for good: every build that transitively needs it is
/// finished, with `DepFailed` for builds whose top level is elsewhere, and
/// the step is removed from the graph.
pub(crate) async fn fail_step(
    scheduler: &Arc<Scheduler>,
    step: &Arc<Step>,
    result: &RemoteResult,
    row_build: Option<BuildId>,
) -> Result<(), DbError> {
    let (builds, _) = get_dependents(step);
    let now = Utc::now();
    let start = result.start_time.unwrap_or(now).timestamp();
    let stop = result.stop_time.unwrap_or(now).timestamp();
    let representative = row_build.or_else(|| builds.iter().map(|b| b.id).min());

    scheduler
        .counters
        .nr_steps_done
        .fetch_add(1, Ordering::Relaxed);

    let mut finished: Vec<(BuildId, BuildStatus)> = Vec::new();
    {
        let _db = GaugeGuard::new(&scheduler.counters.nr_active_db_updates);
        let mut txn = scheduler.pool.begin().await?;
        for b in &builds {
            if b.finished_in_db() {
                continue;
            }
            let is_toplevel = b.toplevel().is_some_and(|t| Arc::ptr_eq(&t, step));
            let status = if is_toplevel {
                result.build_status()
            } else {
                BuildStatus::DepFailed
            };
            if Some(b.id) != row_build {
                // Mirror the failing step into this build's step list so
                // the failure is visible from every affected build.
                queries::create_build_step(
                    &mut *txn,
                    Some(start),
                    b.id,
                    step.drv_path.as_str(),
                    &step.system_type,
                    result.step_status,
                    "",
                    (!result.error_msg.is_empty()).then_some(result.error_msg.as_str()),
                    representative.filter(|r| *r != b.id),
                )
                .await?;
            }
            queries::update_build(&mut *txn, b.id, status, start, stop).await?;
            finished.push((b.id, status));
        }
        if result.step_status == BuildStatus::Failed && result.can_cache {
            let paths: Vec<String> =
                step.drv.outputs.values().map(|p| p.to_string()).collect();
            queries::insert_failed_paths(&mut *txn, &paths).await?;
        }
        if let Some(((first, _), rest)) = finished.split_first() {
            let rest_ids: Vec<BuildId> = rest.iter().map(|(id, _)| *id).collect();
            queries::notify_build_finished(&mut *txn, *first, &rest_ids).await?;
        }
        txn.commit().await?;
    }

    scheduler
        .counters
        .nr_builds_done
        .fetch_add(finished.len() as u64, Ordering::Relaxed);
    {
        let mut registry = scheduler.builds.lock();
        for (id, _) in &finished {
            registry.remove(id);
        }
    }
    for b in &builds {
        if let Some((_, status)) = finished.iter().find(|(id, _)| id == &b.id) {
            b.mark_finished_in_db();
            scheduler.note_build_finished(b.id, *status);
        }
    }

    step.mark_finished();
    scheduler.forget_step(&step.drv_path);
    scheduler.dispatcher_wake.wake();
    Ok(())
}

/// Record a successful step, finish the builds it was the top level of,
/// charge fair-share accounts and unlock dependent steps.
async fn finish_success(
    scheduler: &Arc<Scheduler>,
    step: &Arc<Step>,
    machine: &Arc<Machine>,
    build_id: BuildId,
    step_nr: StepNr,
    result: &RemoteResult,
) -> Result<(), StepError> {
    let now = Utc::now();
    let start = result.start_time.unwrap_or(now).timestamp();
    let stop = result.stop_time.unwrap_or(now).timestamp();

    // Builds may have attached while we were building; take a fresh look.
    let (dependents, _) = get_dependents(step);
    let direct: Vec<_> = dependents
        .iter()
        .filter(|b| b.toplevel().is_some_and(|t| Arc::ptr_eq(&t, step)))
        .cloned()
        .collect();
    let outputs: Vec<(String, String)> = step
        .drv
        .outputs
        .iter()
        .map(|(name, path)| (name.clone(), path.to_string()))
        .collect();

    let mut finished_ids: Vec<BuildId> = Vec::new();
    {
        let _db = GaugeGuard::new(&scheduler.counters.nr_active_db_updates);
        let mut txn = scheduler.pool.begin().await?;
        queries::finish_build_step(&mut *txn, build_id, step_nr, result, &machine.store_uri)
            .await?;
        queries::notify_step_finished(&mut *txn, build_id, step_nr, "").await?;
        for b in &direct {
            if b.finished_in_db() {
                continue;
            }
            queries::update_build(&mut *txn, b.id, BuildStatus::Success, start, stop).await?;
            queries::update_build_outputs(&mut *txn, b.id, &outputs).await?;
            finished_ids.push(b.id);
        }
        if let Some((first, rest)) = finished_ids.split_first() {
            queries::notify_build_finished(&mut *txn, *first, rest).await?;
        }
        txn.commit().await.map_err(DbError::from)?;
    }

    scheduler
        .counters
        .nr_builds_done
        .fetch_add(finished_ids.len() as u64, Ordering::Relaxed);
    {
        let mut registry = scheduler.builds.lock();
        for id in &finished_ids {
            registry.remove(id);
        }
    }
    for b in &direct {
        if finished_ids.contains(&b.id) {
            b.mark_finished_in_db();
            scheduler.note_build_finished(b.id, BuildStatus::Success);
        }
    }

    // Charge execution time to every jobset that was waiting on this step.
    let duration = result.duration_secs();
    let mut charged: Vec<Arc<crate::jobset::Jobset>> = Vec::new();
    for b in &dependents {
        if !charged.iter().any(|j| Arc::ptr_eq(j, &b.jobset)) {
            b.jobset
                .add_step(now, start, duration, scheduler.config.scheduling_window);
            charged.push(b.jobset.clone());
        }
    }

    let counters = &scheduler.counters;
    counters.nr_steps_done.fetch_add(1, Ordering::Relaxed);
    let total = (stop - start).max(0) + result.overhead as i64;
    counters.total_step_time.fetch_add(total, Ordering::Relaxed);
    counters
        .total_step_build_time
        .fetch_add((stop - start).max(0), Ordering::Relaxed);
    machine.state.nr_steps_done.fetch_add(1, Ordering::Relaxed);
    machine.state.total_step_time.fetch_add(total, Ordering::Relaxed);
    machine
        .state
        .total_step_build_time
        .fetch_add((stop - start).max(0), Ordering::Relaxed);

    info!(
        drv = %step.drv_path,
        machine = %machine.store_uri,
        seconds = duration,
        builds_finished = finished_ids.len(),
        "step succeeded"
    );
    unlink_finished_step(scheduler, step);
    Ok(())
}

/// Remove a completed step from the graph: dependents lose the edge and
/// become runnable once their last dependency is gone.
pub(crate) fn unlink_finished_step(scheduler: &Arc<Scheduler>, step: &Arc<Step>) -> usize {
    step.mark_finished();
    scheduler.forget_step(&step.drv_path);
    let rdeps: Vec<_> = step.state.lock().rdeps.clone();
    let mut unlocked = 0;
    for rdep in rdeps.iter().filter_map(std::sync::Weak::upgrade) {
        let now_runnable = {
            let mut state = rdep.state.lock();
            state.deps.remove(&step.drv_path);
            state.created && state.deps.is_empty()
        };
        if now_runnable && !rdep.finished() {
            scheduler.make_runnable(&rdep);
            unlocked += 1;
        }
    }
    scheduler.dispatcher_wake.wake();
    unlocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::expand::expand_build;
    use crate::expand::testing::{make_build, seed_derivation};
    use crate::state::test_support::make_scheduler;
    use crate::step::testing::make_step;
    use kiln_store::{Connector as _, Store as _};

    #[tokio::test]
    async fn completing_a_dependency_unlocks_its_parent() {
        let (scheduler, _, local, _) = make_scheduler(RunnerConfig::default());
        let (dep_drv, _) = seed_derivation(&local, "dep", &[]);
        let (top_drv, _) = seed_derivation(&local, "top", &[&dep_drv]);
        let build = make_build(1, &top_drv);

        let mut finished = BTreeSet::new();
        let result = expand_build(&scheduler, &build, &mut finished).await.unwrap();
        for step in &result.new_runnable {
            scheduler.make_runnable(step);
        }
        let dep = scheduler.steps.lock().get(&dep_drv).unwrap().upgrade().unwrap();

        let unlocked = unlink_finished_step(&scheduler, &dep);
        assert_eq!(unlocked, 1);
        assert!(scheduler.steps.lock().get(&dep_drv).is_none());

        // the parent is now on the runnable list
        let runnable: Vec<_> = scheduler
            .runnable
            .lock()
            .iter()
            .filter_map(std::sync::Weak::upgrade)
            .collect();
        assert!(runnable.iter().any(|s| s.drv_path == top_drv));
    }

    #[tokio::test]
    async fn transfer_sends_only_missing_closure() {
        let (scheduler, connector, local, dest) = make_scheduler(RunnerConfig::default());
        let machine = connector.add_machine("mem://m1");
        let client = connector.connect("mem://m1").await.unwrap();

        // source with a reference chain in the local store
        let leaf_src = local.add_text("leaf-src", "leaf", &[]);
        let src = local.add_text("src", "src", &[leaf_src.clone()]);
        // a dependency whose output is already registered in the
        // destination store
        let dep_out = dest.add_text("dep", "built:dep", &[]);
        let dep_drv = local.add_derivation(kiln_store::Derivation {
            name: "dep".into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            outputs: [("out".to_string(), dep_out.clone())].into_iter().collect(),
            ..Default::default()
        });

        let out = StorePath::derive("top", "top-out");
        let top_drv_path = local.add_derivation(kiln_store::Derivation {
            name: "top".into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            outputs: [("out".to_string(), out)].into_iter().collect(),
            input_drvs: [(dep_drv.clone(), ["out".to_string()].into_iter().collect())]
                .into_iter()
                .collect(),
            input_srcs: [src.clone()].into_iter().collect(),
            ..Default::default()
        });
        let drv = scheduler.local_store.read_derivation(&top_drv_path).await.unwrap();
        let step = Arc::new(Step::new(top_drv_path, drv, "x86_64-linux"));

        // machine already has the source leaf
        let info = local.query_path_info(&leaf_src).await.unwrap().unwrap();
        let nar = local.nar_from_path(&leaf_src).await.unwrap();
        machine.store().add_to_store(info, nar).await.unwrap();

        let bytes = transfer_inputs(&scheduler, client.as_ref(), &step).await.unwrap();
        assert!(bytes > 0);
        assert!(machine.store().contains(&src));
        assert!(machine.store().contains(&dep_out));
        assert!(machine.store().contains(&leaf_src));
    }

    #[tokio::test]
    async fn fetched_outputs_land_in_the_destination_store() {
        let (scheduler, connector, local, dest) = make_scheduler(RunnerConfig::default());
        connector.add_machine("mem://m1");
        let client = connector.connect("mem://m1").await.unwrap();

        let (drv_path, out) = seed_derivation(&local, "hello", &[]);
        let drv = local.read_derivation(&drv_path).await.unwrap();
        let step = Arc::new(Step::new(drv_path.clone(), drv.clone(), "x86_64-linux"));

        client
            .build_derivation(&drv_path, &drv, &BuildOptions::default())
            .await
            .unwrap();
        let bytes = fetch_outputs(&scheduler, client.as_ref(), &step).await.unwrap();
        assert!(bytes > 0);
        assert!(dest.contains(&out));
    }

    #[tokio::test]
    async fn oversized_outputs_are_rejected() {
        let mut config = RunnerConfig::default();
        config.max_output_size = 4;
        let (scheduler, connector, local, dest) = make_scheduler(config);
        connector.add_machine("mem://m1");
        let client = connector.connect("mem://m1").await.unwrap();

        let (drv_path, out) = seed_derivation(&local, "big", &[]);
        let drv = local.read_derivation(&drv_path).await.unwrap();
        let step = Arc::new(Step::new(drv_path.clone(), drv.clone(), "x86_64-linux"));
        client
            .build_derivation(&drv_path, &drv, &BuildOptions::default())
            .await
            .unwrap();

        let err = fetch_outputs(&scheduler, client.as_ref(), &step).await.unwrap_err();
        assert!(matches!(err, StoreError::NarTooLarge { .. }));
        assert!(!dest.contains(&out));
    }

    #[tokio::test]
    async fn cancelled_step_with_no_builds_is_dropped() {
        let (scheduler, _, _, _) = make_scheduler(RunnerConfig::default());
        let step = make_step("doomed");
        step.state.lock().created = true;
        scheduler
            .steps
            .lock()
            .insert(step.drv_path.clone(), Arc::downgrade(&step));

        assert!(!resolve_maybe_cancelled(&scheduler, &step));
        assert!(step.finished());
        assert!(scheduler.steps.lock().get(&step.drv_path).is_none());
    }

    #[tokio::test]
    async fn cancelled_step_with_live_builds_is_requeued() {
        let (scheduler, _, local, _) = make_scheduler(RunnerConfig::default());
        let (top_drv, _) = seed_derivation(&local, "alive", &[]);
        let build = make_build(1, &top_drv);
        let mut finished = BTreeSet::new();
        let result = expand_build(&scheduler, &build, &mut finished).await.unwrap();
        let step = result.toplevel.unwrap();
        // simulate the dispatcher having taken it off the runnable list
        scheduler.runnable.lock().clear();

        assert!(resolve_maybe_cancelled(&scheduler, &step));
        assert_eq!(scheduler.runnable.lock().len(), 1);
        assert!(!step.finished());
    }

    #[test]
    fn representative_prefers_the_build_one_target() {
        let top = make_step("top");
        let b1 = make_build(5, &top.drv_path);
        let b2 = make_build(9, &top.drv_path);
        let builds = vec![b2.clone(), b1.clone()];

        let picked = representative_build(&builds, None);
        assert_eq!(picked.id, BuildId::new(5));
        let picked = representative_build(&builds, Some(BuildId::new(9)));
        assert_eq!(picked.id, BuildId::new(9));
    }
}
