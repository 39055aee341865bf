//! Provisioning pipeline
//!
//! Drives an environment from a verified artifact to `Ready`, one stage at a
//! time, persisting every transition through the registry.

pub mod provisioner;
pub mod tasks;
pub mod workflow;

pub use provisioner::{validate_user, Provisioner};
pub use tasks::ExecTask;
pub use workflow::{run_tasks, StageResult, TaskExecutor};
