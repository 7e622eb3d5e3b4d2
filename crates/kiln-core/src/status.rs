//! The build status taxonomy and remote build results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Terminal status of a build or build step.
///
/// The numeric values are the wire/database discriminants and must not be
/// renumbered; downstream consumers of the `builds` and `build_steps` tables
/// interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum BuildStatus {
    Success = 0,
    Failed = 1,
    /// A dependency failed; builds only.
    DepFailed = 2,
    /// Transport or infrastructure failure; may be retried.
    Aborted = 3,
    Cancelled = 4,
    /// Build produced output but exited non-zero; builds only.
    FailedWithOutput = 6,
    TimedOut = 7,
    /// A previous failure of the same derivation was cached; steps only.
    CachedFailure = 8,
    /// No machine supports the step's system type.
    Unsupported = 9,
    LogLimitExceeded = 10,
    NarSizeLimitExceeded = 11,
    NotDeterministic = 12,
    /// Step is currently being worked on. Transient, never persisted as a
    /// terminal status.
    Busy = 100,
}

impl BuildStatus {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Success,
            1 => Self::Failed,
            2 => Self::DepFailed,
            3 => Self::Aborted,
            4 => Self::Cancelled,
            6 => Self::FailedWithOutput,
            7 => Self::TimedOut,
            8 => Self::CachedFailure,
            9 => Self::Unsupported,
            10 => Self::LogLimitExceeded,
            11 => Self::NarSizeLimitExceeded,
            12 => Self::NotDeterministic,
            100 => Self::Busy,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether a step failing with this status may be retried on another
    /// attempt rather than failing its dependent builds outright.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Aborted | Self::Busy)
    }
}

/// Phase of an in-flight build step, recorded on its `build_steps` row so
/// operators can see where time is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum StepPhase {
    Preparing = 1,
    Connecting = 10,
    SendingInputs = 20,
    Building = 30,
    WaitingForLocalSlot = 35,
    ReceivingOutputs = 40,
    PostProcessing = 50,
}

impl StepPhase {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Status reported by a remote machine for one `build_derivation` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBuildStatus {
    Built,
    PermanentFailure,
    /// Infrastructure trouble on the machine; worth another attempt.
    TransientFailure,
    TimedOut,
    LogLimitExceeded,
    NotDeterministic,
}

/// Raw outcome of one `build_derivation` call on a remote machine.
#[derive(Debug, Clone)]
pub struct RemoteBuildResult {
    pub status: RemoteBuildStatus,
    pub error_msg: String,
    pub times_built: u32,
    pub is_non_deterministic: bool,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
}

/// Accumulated result of executing a step, from reservation to completion.
///
/// This is what the builder worker hands to the database layer; it carries
/// both the remote build outcome and the local bookkeeping around it.
#[derive(Debug, Clone)]
pub struct RemoteResult {
    pub step_status: BuildStatus,
    /// Meaningful for `Aborted`: whether the failure looked transient.
    pub can_retry: bool,
    /// Meaningful for `Success`: the outputs were already present.
    pub is_cached: bool,
    /// Meaningful for `Failed`: the failure may be recorded in the failure
    /// cache.
    pub can_cache: bool,
    pub error_msg: String,
    pub times_built: u32,
    pub is_non_deterministic: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    /// Seconds spent outside the remote build proper (closure copying).
    pub overhead: u32,
    pub log_file: Option<PathBuf>,
}

impl Default for RemoteResult {
    fn default() -> Self {
        Self {
            step_status: BuildStatus::Aborted,
            can_retry: false,
            is_cached: false,
            can_cache: false,
            error_msg: String::new(),
            times_built: 0,
            is_non_deterministic: false,
            start_time: None,
            stop_time: None,
            overhead: 0,
            log_file: None,
        }
    }
}

impl RemoteResult {
    /// The status to record at the build level. A cached step failure is an
    /// ordinary failure from the build's point of view.
    pub fn build_status(&self) -> BuildStatus {
        match self.step_status {
            BuildStatus::CachedFailure => BuildStatus::Failed,
            s => s,
        }
    }

    /// Fold the outcome of a remote `build_derivation` call into this result.
    pub fn update_with(&mut self, res: &RemoteBuildResult) {
        self.step_status = match res.status {
            RemoteBuildStatus::Built => BuildStatus::Success,
            RemoteBuildStatus::PermanentFailure => {
                self.can_cache = true;
                BuildStatus::Failed
            }
            RemoteBuildStatus::TransientFailure => {
                self.can_retry = true;
                BuildStatus::Aborted
            }
            RemoteBuildStatus::TimedOut => BuildStatus::TimedOut,
            RemoteBuildStatus::LogLimitExceeded => BuildStatus::LogLimitExceeded,
            RemoteBuildStatus::NotDeterministic => BuildStatus::NotDeterministic,
        };
        self.error_msg = res.error_msg.clone();
        self.times_built = res.times_built;
        self.is_non_deterministic = res.is_non_deterministic;
        self.start_time = Some(res.start_time);
        self.stop_time = Some(res.stop_time);
    }

    pub fn duration_secs(&self) -> i64 {
        match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => (stop - start).num_seconds().max(0),
            _ => 0,
        }
    }
}
