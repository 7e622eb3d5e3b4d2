//! Store and build-machine abstractions for the Kiln queue runner.
//!
//! The scheduling engine never talks to a concrete store backend; it goes
//! through the [`Store`] trait for the local and destination stores and
//! through [`client::BuildClient`] for remote build machines. Backends are
//! selected at construction time by the binary.

pub mod client;
pub mod derivation;
pub mod error;
pub mod memory;
pub mod nar;
pub mod path;
pub mod store;

pub use client::{
    BuildClient, BuildOptions, Connector, InProcessConnector, InProcessMachine, PlannedOutcome,
};
pub use derivation::{Derivation, DerivationOptions};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use nar::{Nar, NarMember};
pub use path::StorePath;
pub use store::{compute_closure, PathInfo, Store};
