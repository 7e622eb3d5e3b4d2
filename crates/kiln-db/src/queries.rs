//! Query functions.
//!
//! Functions take `&mut PgConnection` so callers can compose them into a
//! transaction where a build's completion must be recorded atomically.

use crate::error::DbResult;
use crate::models::{BuildPriorityRow, BuildRow, JobsetSharesRow};
use kiln_core::{BuildId, BuildStatus, RemoteResult, StepNr, StepPhase};
use sqlx::PgConnection;

/// Unfinished builds with an id above `after`, highest global priority
/// first. `build_one` restricts the load to a single build id.
pub async fn get_pending_builds(
    conn: &mut PgConnection,
    after: i32,
    build_one: Option<BuildId>,
) -> DbResult<Vec<BuildRow>> {
    let rows = sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, drv_path, jobset_id, project, jobset, job, timestamp,
               max_silent_time, build_timeout, local_priority, global_priority
        FROM builds
        WHERE finished = false AND id > $1 AND ($2::int IS NULL OR id = $2)
        ORDER BY global_priority DESC, id ASC
        "#,
    )
    .bind(after)
    .bind(build_one.map(|b| b.as_i32()))
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Ids and global priorities of every unfinished build. The in-memory set
/// is reconciled against this to detect cancellations and bumps.
pub async fn get_build_priorities(conn: &mut PgConnection) -> DbResult<Vec<BuildPriorityRow>> {
    let rows = sqlx::query_as::<_, BuildPriorityRow>(
        "SELECT id, global_priority FROM builds WHERE finished = false",
    )
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn get_jobset_shares(conn: &mut PgConnection) -> DbResult<Vec<JobsetSharesRow>> {
    let rows = sqlx::query_as::<_, JobsetSharesRow>(
        "SELECT id, project, name, scheduling_shares FROM jobsets",
    )
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// `(start_time, duration)` of recent finished steps of a jobset, for
/// seeding fair-share accounting when a jobset is first seen.
pub async fn get_jobset_step_times(
    conn: &mut PgConnection,
    project: &str,
    jobset: &str,
    since: i64,
) -> DbResult<Vec<(i64, i64)>> {
    let rows = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT s.start_time, s.stop_time - s.start_time
        FROM build_steps s JOIN builds b ON s.build_id = b.id
        WHERE b.project = $1 AND b.jobset = $2
          AND s.start_time IS NOT NULL AND s.stop_time IS NOT NULL
          AND s.start_time >= $3
        "#,
    )
    .bind(project)
    .bind(jobset)
    .bind(since)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Allocate the next step number for a build and insert its row.
pub async fn create_build_step(
    conn: &mut PgConnection,
    start_time: Option<i64>,
    build_id: BuildId,
    drv_path: &str,
    system: &str,
    status: BuildStatus,
    machine: &str,
    error_msg: Option<&str>,
    propagated_from: Option<BuildId>,
) -> DbResult<StepNr> {
    let step_nr: StepNr = sqlx::query_scalar(
        "SELECT COALESCE(MAX(step_nr), 0) + 1 FROM build_steps WHERE build_id = $1",
    )
    .bind(build_id.as_i32())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO build_steps
            (build_id, step_nr, type, drv_path, system, busy, status, machine,
             error_msg, start_time, propagated_from)
        VALUES ($1, $2, 0, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(build_id.as_i32())
    .bind(step_nr)
    .bind(drv_path)
    .bind(system)
    .bind(status == BuildStatus::Busy)
    .bind(if status == BuildStatus::Busy { None } else { Some(status.as_i32()) })
    .bind(machine)
    .bind(error_msg)
    .bind(start_time)
    .bind(propagated_from.map(|b| b.as_i32()))
    .execute(conn)
    .await?;
    Ok(step_nr)
}

/// Record that a derivation's outputs were obtained by substitution rather
/// than building.
pub async fn create_substitution_step(
    conn: &mut PgConnection,
    build_id: BuildId,
    drv_path: &str,
    output_name: &str,
    store_path: &str,
    start_time: i64,
    stop_time: i64,
) -> DbResult<StepNr> {
    let step_nr: StepNr = sqlx::query_scalar(
        "SELECT COALESCE(MAX(step_nr), 0) + 1 FROM build_steps WHERE build_id = $1",
    )
    .bind(build_id.as_i32())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO build_steps
            (build_id, step_nr, type, drv_path, output_name, store_path, busy,
             status, start_time, stop_time)
        VALUES ($1, $2, 1, $3, $4, $5, false, $6, $7, $8)
        "#,
    )
    .bind(build_id.as_i32())
    .bind(step_nr)
    .bind(drv_path)
    .bind(output_name)
    .bind(store_path)
    .bind(BuildStatus::Success.as_i32())
    .bind(start_time)
    .bind(stop_time)
    .execute(conn)
    .await?;
    Ok(step_nr)
}

/// Record the phase an active step is in.
pub async fn update_build_step(
    conn: &mut PgConnection,
    build_id: BuildId,
    step_nr: StepNr,
    phase: StepPhase,
) -> DbResult<()> {
    sqlx::query("UPDATE build_steps SET busy = true, phase = $3 WHERE build_id = $1 AND step_nr = $2")
        .bind(build_id.as_i32())
        .bind(step_nr)
        .bind(phase.as_i32())
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn finish_build_step(
    conn: &mut PgConnection,
    build_id: BuildId,
    step_nr: StepNr,
    result: &RemoteResult,
    machine: &str,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE build_steps
        SET busy = false, status = $3, error_msg = $4, start_time = $5,
            stop_time = $6, machine = $7, overhead = $8, times_built = $9,
            is_non_deterministic = $10
        WHERE build_id = $1 AND step_nr = $2
        "#,
    )
    .bind(build_id.as_i32())
    .bind(step_nr)
    .bind(result.step_status.as_i32())
    .bind(if result.error_msg.is_empty() { None } else { Some(result.error_msg.as_str()) })
    .bind(result.start_time.map(|t| t.timestamp()))
    .bind(result.stop_time.map(|t| t.timestamp()))
    .bind(machine)
    .bind(result.overhead as i32)
    .bind(result.times_built as i32)
    .bind(result.is_non_deterministic)
    .execute(conn)
    .await?;
    Ok(())
}

/// Mark a build finished with the given status.
pub async fn update_build(
    conn: &mut PgConnection,
    build_id: BuildId,
    status: BuildStatus,
    start_time: i64,
    stop_time: i64,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE builds
        SET finished = true, status = $2, start_time = $3, stop_time = $4
        WHERE id = $1
        "#,
    )
    .bind(build_id.as_i32())
    .bind(status.as_i32())
    .bind(start_time)
    .bind(stop_time)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record a build's outputs on success.
pub async fn update_build_outputs(
    conn: &mut PgConnection,
    build_id: BuildId,
    outputs: &[(String, String)],
) -> DbResult<()> {
    for (name, path) in outputs {
        sqlx::query(
            r#"
            INSERT INTO build_outputs (build_id, name, path)
            VALUES ($1, $2, $3)
            ON CONFLICT (build_id, name) DO UPDATE SET path = EXCLUDED.path
            "#,
        )
        .bind(build_id.as_i32())
        .bind(name)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Reset step rows left busy by a previous run of the queue runner.
pub async fn clear_busy(conn: &mut PgConnection, stop_time: i64) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE build_steps SET busy = false, status = $1, stop_time = $2 WHERE busy = true",
    )
    .bind(BuildStatus::Aborted.as_i32())
    .bind(stop_time)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Abort one step row if it is still marked busy. Used to clean up steps
/// orphaned by an earlier database error.
pub async fn abort_busy_step(
    conn: &mut PgConnection,
    build_id: BuildId,
    step_nr: StepNr,
    stop_time: i64,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE build_steps SET busy = false, status = $3, stop_time = $4
        WHERE build_id = $1 AND step_nr = $2 AND busy = true
        "#,
    )
    .bind(build_id.as_i32())
    .bind(step_nr)
    .bind(BuildStatus::Aborted.as_i32())
    .bind(stop_time)
    .execute(conn)
    .await?;
    Ok(())
}

/// Whether any of the given output paths has a cached failure on record.
pub async fn check_cached_failure(conn: &mut PgConnection, paths: &[String]) -> DbResult<bool> {
    let hit: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM failed_paths WHERE path = ANY($1) LIMIT 1")
            .bind(paths)
            .fetch_optional(conn)
            .await?;
    Ok(hit.is_some())
}

pub async fn insert_failed_paths(conn: &mut PgConnection, paths: &[String]) -> DbResult<()> {
    for path in paths {
        sqlx::query("INSERT INTO failed_paths (path) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(path)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Store the runner's status dump where `--status` can read it back.
pub async fn upsert_status(conn: &mut PgConnection, status: &serde_json::Value) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO system_status (what, status)
        VALUES ('queue-runner', $1)
        ON CONFLICT (what) DO UPDATE SET status = EXCLUDED.status
        "#,
    )
    .bind(status)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_status(conn: &mut PgConnection) -> DbResult<Option<serde_json::Value>> {
    let status = sqlx::query_scalar("SELECT status FROM system_status WHERE what = 'queue-runner'")
        .fetch_optional(conn)
        .await?;
    Ok(status)
}

pub async fn notify(conn: &mut PgConnection, channel: &str, payload: &str) -> DbResult<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn notify_build_started(conn: &mut PgConnection, build_id: BuildId) -> DbResult<()> {
    notify(conn, "build_started", &build_id.to_string()).await
}

/// `build_finished` carries the finished build id followed by the ids of
/// dependent builds finished along with it, tab-separated.
pub async fn notify_build_finished(
    conn: &mut PgConnection,
    build_id: BuildId,
    dependent_ids: &[BuildId],
) -> DbResult<()> {
    let mut payload = build_id.to_string();
    for id in dependent_ids {
        payload.push('\t');
        payload.push_str(&id.to_string());
    }
    notify(conn, "build_finished", &payload).await
}

pub async fn notify_step_finished(
    conn: &mut PgConnection,
    build_id: BuildId,
    step_nr: StepNr,
    log_file: &str,
) -> DbResult<()> {
    notify(
        conn,
        "step_finished",
        &format!("{build_id}\t{step_nr}\t{log_file}"),
    )
    .await
}
