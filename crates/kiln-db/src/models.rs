//! Row models.

use sqlx::FromRow;

/// A pending row of the `builds` table, as loaded by the queue monitor.
#[derive(Debug, Clone, FromRow)]
pub struct BuildRow {
    pub id: i32,
    pub drv_path: String,
    pub jobset_id: i32,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub timestamp: i64,
    pub max_silent_time: i32,
    pub build_timeout: i32,
    pub local_priority: i32,
    pub global_priority: i32,
}

/// Current global priority of an unfinished build, used to reconcile
/// cancellations, deletions and priority bumps.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct BuildPriorityRow {
    pub id: i32,
    pub global_priority: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobsetSharesRow {
    pub id: i32,
    pub project: String,
    pub name: String,
    pub scheduling_shares: i32,
}
