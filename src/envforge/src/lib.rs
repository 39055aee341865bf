//! envforge
//!
//! Provisions named Linux environments from a verified root filesystem image.
//! It combines artifact verification, a persisted environment registry, a staged
//! provisioning pipeline and a command bridge to the virtualization backend.

pub mod config;
pub mod progress;
pub mod provisioner;

pub use config::ProvisionerConfig;
pub use progress::ProvisionProgress;
pub use provisioner::{
    ChannelProgressReporter, ProgressReporter, ProvisionError, StageFailure, TracingProgressReporter,
};

// Common types and traits
pub mod common;
pub use common::*;

// Integrity verifier
pub mod artifact;
pub use artifact::{
    ArtifactFetcher, ArtifactRef, FetchError, HttpFetcher, IntegrityError, IntegrityVerifier,
    VerifiedArtifact, VerifyError,
};

// Command bridge and backend control plane
pub mod bridge;
pub use bridge::{BackendControl, BackendError, ProcessBridge};

// Environment registry
pub mod registry;
pub use registry::{Environment, EnvironmentRegistry, EnvironmentState, RegistryError};

// Provisioning pipeline
pub mod pipeline;
pub use pipeline::{ExecTask, Provisioner, StageResult};
