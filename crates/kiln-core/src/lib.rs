//! Core domain types for the Kiln queue runner.
//!
//! This crate contains:
//! - Build and jobset identifiers
//! - The build status taxonomy and step phases
//! - Remote build results and their mapping to build statuses
//! - System-type strings used for capability matching

pub mod id;
pub mod status;
pub mod system;

pub use id::{BuildId, JobsetId, StepNr};
pub use status::{BuildStatus, RemoteBuildResult, RemoteBuildStatus, RemoteResult, StepPhase};
pub use system::system_type;
