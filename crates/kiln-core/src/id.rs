//! Build and jobset identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifier of a build row in the database.
///
/// Builds are created externally (by the evaluator) and assigned sequential
/// ids; the queue runner only ever reads them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct BuildId(i32);

impl BuildId {
    pub const MAX: BuildId = BuildId(i32::MAX);

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl From<i32> for BuildId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Identifier of a jobset row in the database.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct JobsetId(i32);

impl JobsetId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl From<i32> for JobsetId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Sequence number of a step row within a build.
pub type StepNr = i32;
