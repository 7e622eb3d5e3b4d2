//! In-memory scheduling engine of the Kiln queue runner.
//!
//! The scheduler reflects the database's pending builds into a DAG of
//! builds, steps and jobsets, dispatches runnable steps to build machines
//! under fair-share and priority policy, and records results back. It is
//! structured as a handful of long-lived tasks sharing one [`Scheduler`]
//! value:
//! - the queue monitor ([`queue_monitor`]) reconciling database and graph,
//! - the dispatcher ([`dispatch`]) pairing steps with machines,
//! - builder workers ([`builder`]) executing one step each,
//! - the machine-list reloader ([`machine::machine_reloader`]).

pub mod build;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod expand;
pub mod jobset;
pub mod machine;
pub mod queue_monitor;
pub mod state;
pub mod status;
pub mod step;
pub mod wake;

pub use build::Build;
pub use config::RunnerConfig;
pub use dispatch::dispatcher;
pub use jobset::Jobset;
pub use machine::{machine_reloader, Machine};
pub use queue_monitor::{clear_busy_on_start, queue_monitor};
pub use state::Scheduler;
pub use step::Step;
