//! Environment registry
//!
//! Tracks named environments, their lifecycle state and storage paths. Records
//! are persisted one JSON file per environment so a crash between stages leaves
//! the last completed state on disk.

pub mod locks;
pub mod state;
pub mod store;

pub use locks::NameLocks;
pub use state::EnvironmentState;
pub use store::{validate_name, Environment, EnvironmentRegistry, RegistryError};
