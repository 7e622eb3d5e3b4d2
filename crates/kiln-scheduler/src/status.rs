//! Status dump: a JSON snapshot of the runner's whole in-memory picture,
//! written to the `system_status` table on request.

use crate::machine::Machine;
use crate::state::Scheduler;
use chrono::{DateTime, Utc};
use kiln_db::{queries, DbError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub status: &'static str,
    pub time: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub nr_queued_builds: usize,
    pub nr_unfinished_steps: usize,
    pub nr_runnable_steps: usize,
    pub nr_active_steps: usize,
    pub nr_builds_read: u64,
    pub build_read_time_ms: u64,
    pub nr_builds_done: u64,
    pub nr_steps_started: u64,
    pub nr_steps_done: u64,
    pub nr_steps_building: u64,
    pub nr_steps_copying_to: u64,
    pub nr_steps_copying_from: u64,
    pub nr_steps_waiting: u64,
    pub nr_unsupported_steps: u64,
    pub nr_retries: u64,
    pub max_nr_retries: u64,
    pub total_step_time: i64,
    pub total_step_build_time: i64,
    pub nr_queue_wakeups: u64,
    pub nr_dispatcher_wakeups: u64,
    pub dispatch_time_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub nr_active_db_updates: u64,
    pub machines: BTreeMap<String, MachineStatus>,
    pub jobsets: BTreeMap<String, JobsetStatus>,
    pub machine_types: BTreeMap<String, MachineTypeStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    pub enabled: bool,
    pub system_types: Vec<String>,
    pub max_jobs: u32,
    pub speed_factor: f32,
    pub current_jobs: u32,
    pub idle_since: i64,
    pub nr_steps_done: u64,
    pub total_step_time: i64,
    pub total_step_build_time: i64,
    pub disabled_until: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl From<&Arc<Machine>> for MachineStatus {
    fn from(machine: &Arc<Machine>) -> Self {
        let connect_info = machine.state.connect_info();
        Self {
            enabled: machine.state.enabled.load(Ordering::SeqCst),
            system_types: machine.system_types.iter().cloned().collect(),
            max_jobs: machine.max_jobs,
            speed_factor: machine.speed_factor,
            current_jobs: machine.current_jobs(),
            idle_since: machine.state.idle_since.load(Ordering::SeqCst),
            nr_steps_done: machine.state.nr_steps_done.load(Ordering::Relaxed),
            total_step_time: machine.state.total_step_time.load(Ordering::Relaxed),
            total_step_build_time: machine.state.total_step_build_time.load(Ordering::Relaxed),
            disabled_until: connect_info.disabled_until,
            last_failure: connect_info.last_failure,
            consecutive_failures: connect_info.consecutive_failures,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsetStatus {
    pub shares: u32,
    pub seconds: i64,
    pub share_used: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTypeStatus {
    pub runnable: u32,
    pub running: u32,
    pub last_active: Option<DateTime<Utc>>,
    pub wait_time_seconds: i64,
}

impl Status {
    pub fn collect(scheduler: &Scheduler) -> Self {
        let now = Utc::now();
        let counters = &scheduler.counters;
        let machines = scheduler
            .machines
            .lock()
            .iter()
            .map(|(uri, machine)| (uri.clone(), MachineStatus::from(machine)))
            .collect();
        let jobsets = scheduler
            .jobsets
            .lock()
            .iter()
            .map(|((project, name), jobset)| {
                (
                    format!("{project}:{name}"),
                    JobsetStatus {
                        shares: jobset.shares(),
                        seconds: jobset.seconds(),
                        share_used: jobset.share_used(),
                    },
                )
            })
            .collect();
        let machine_types = scheduler
            .machine_types
            .lock()
            .iter()
            .map(|(system, stats)| {
                (
                    system.clone(),
                    MachineTypeStatus {
                        runnable: stats.runnable,
                        running: stats.running,
                        last_active: stats.last_active,
                        wait_time_seconds: stats.wait_time_secs,
                    },
                )
            })
            .collect();

        Self {
            status: "up",
            time: now,
            uptime_seconds: (now - scheduler.started_at).num_seconds(),
            nr_queued_builds: scheduler.builds.lock().len(),
            nr_unfinished_steps: scheduler.steps.lock().len(),
            nr_runnable_steps: scheduler.runnable.lock().len(),
            nr_active_steps: scheduler.active_steps.lock().len(),
            nr_builds_read: counters.nr_builds_read.load(Ordering::Relaxed),
            build_read_time_ms: counters.build_read_time_ms.load(Ordering::Relaxed),
            nr_builds_done: counters.nr_builds_done.load(Ordering::Relaxed),
            nr_steps_started: counters.nr_steps_started.load(Ordering::Relaxed),
            nr_steps_done: counters.nr_steps_done.load(Ordering::Relaxed),
            nr_steps_building: counters.nr_steps_building.load(Ordering::Relaxed),
            nr_steps_copying_to: counters.nr_steps_copying_to.load(Ordering::Relaxed),
            nr_steps_copying_from: counters.nr_steps_copying_from.load(Ordering::Relaxed),
            nr_steps_waiting: counters.nr_steps_waiting.load(Ordering::Relaxed),
            nr_unsupported_steps: counters.nr_unsupported_steps.load(Ordering::Relaxed),
            nr_retries: counters.nr_retries.load(Ordering::Relaxed),
            max_nr_retries: counters.max_nr_retries.load(Ordering::Relaxed),
            total_step_time: counters.total_step_time.load(Ordering::Relaxed),
            total_step_build_time: counters.total_step_build_time.load(Ordering::Relaxed),
            nr_queue_wakeups: counters.nr_queue_wakeups.load(Ordering::Relaxed),
            nr_dispatcher_wakeups: counters.nr_dispatcher_wakeups.load(Ordering::Relaxed),
            dispatch_time_ms: counters.dispatch_time_ms.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            nr_active_db_updates: counters.nr_active_db_updates.load(Ordering::Relaxed),
            machines,
            jobsets,
            machine_types,
        }
    }
}

/// Serialize the current picture into the `system_status` table, where
/// `--status` (and anything else) can read it back.
pub async fn dump_status(scheduler: &Scheduler) -> Result<(), DbError> {
    let status = Status::collect(scheduler);
    let value = match serde_json::to_value(&status) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "could not serialize status");
            return Ok(());
        }
    };
    let mut conn = scheduler.pool.acquire().await?;
    queries::upsert_status(&mut *conn, &value).await?;
    info!("dumped status");
    Ok(())
}
