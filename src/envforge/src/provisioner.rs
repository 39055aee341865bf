//! Progress reporting and error types for provisioning operations.

use crate::artifact::VerifyError;
use crate::common::{BridgeError, Stage};
use crate::progress::ProvisionProgress;
use crate::registry::RegistryError;
use std::fmt;

/// Sends progress events over a bounded channel. Events are dropped when
/// the receiver lags.
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::Sender<ProvisionProgress>,
    environment: Option<String>,
}

impl ChannelProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::Sender<ProvisionProgress>) -> Self {
        Self {
            sender,
            environment: None,
        }
    }

    /// Tag every event with the environment name.
    pub fn with_environment(
        sender: tokio::sync::mpsc::Sender<ProvisionProgress>,
        environment: String,
    ) -> Self {
        Self {
            sender,
            environment: Some(environment),
        }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        self.emit_detailed(percentage, message, None, None);
    }

    fn emit_detailed(
        &self,
        percentage: u32,
        message: String,
        stage: Option<Stage>,
        task_name: Option<String>,
    ) {
        let progress = ProvisionProgress::new(self.environment.clone(), percentage, message)
            .with_detail(stage, task_name);
        if self.sender.try_send(progress).is_err() {
            tracing::debug!("[Progress] Receiver full or closed, event dropped");
        }
    }
}

/// Reporter that only logs.
pub struct TracingProgressReporter;

impl ProgressReporter for TracingProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[Progress] {:>3}% {}", percentage.min(100), message);
    }

    fn emit_detailed(
        &self,
        percentage: u32,
        message: String,
        stage: Option<Stage>,
        task_name: Option<String>,
    ) {
        match (stage, task_name) {
            (Some(stage), Some(task)) => tracing::info!(
                "[Progress] {:>3}% [{}] {} ({})",
                percentage.min(100),
                stage,
                message,
                task
            ),
            (Some(stage), None) => {
                tracing::info!("[Progress] {:>3}% [{}] {}", percentage.min(100), stage, message)
            }
            _ => self.emit(percentage, message),
        }
    }
}

/// Receives progress from a provisioning run.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, percentage: u32, message: String);

    /// Progress tagged with the pipeline stage and the task being run.
    fn emit_detailed(
        &self,
        percentage: u32,
        message: String,
        _stage: Option<Stage>,
        _task_name: Option<String>,
    ) {
        self.emit(percentage, message);
    }
}

/// A stage ended without success. Terminal for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    /// Exit code of the failing command, when one ran
    pub exit_code: Option<i32>,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            stage,
            exit_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} failed (exit {}): {}", self.stage, code, self.message),
            None => write!(f, "{} failed: {}", self.stage, self.message),
        }
    }
}

impl std::error::Error for StageFailure {}

/// Error type for provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Artifact verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("{stage} could not run a command: {source}")]
    Bridge {
        stage: Stage,
        #[source]
        source: BridgeError,
    },

    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error("Cancelled before {0}")]
    Cancelled(Stage),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Stage the run failed in, if the failure belongs to one.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            ProvisionError::Verify(_) => Some(Stage::ArtifactVerifying),
            ProvisionError::Bridge { stage, .. } => Some(*stage),
            ProvisionError::Stage(failure) => Some(failure.stage),
            _ => None,
        }
    }

    /// Process exit code for the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Config(_) => 2,
            ProvisionError::Verify(_) => 3,
            ProvisionError::Registry(_) => 4,
            ProvisionError::Bridge { .. } | ProvisionError::Stage(_) => 5,
            ProvisionError::Cancelled(_) => 130,
            ProvisionError::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_display_includes_exit_code() {
        let failure = StageFailure::new(Stage::Bootstrapping, Some(100), "apt-get install");
        assert_eq!(
            failure.to_string(),
            "Bootstrapping failed (exit 100): apt-get install"
        );
        let failure = StageFailure::new(Stage::Configuring, None, "no runner");
        assert_eq!(failure.to_string(), "Configuring failed: no runner");
    }

    #[test]
    fn exit_codes_are_non_zero() {
        let errors = vec![
            ProvisionError::Config("x".into()),
            ProvisionError::Stage(StageFailure::new(Stage::Instantiating, Some(1), "import")),
            ProvisionError::Cancelled(Stage::Configuring),
        ];
        for e in errors {
            assert_ne!(e.exit_code(), 0, "{}", e);
        }
    }

    #[tokio::test]
    async fn channel_reporter_tags_environment() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let reporter = ChannelProgressReporter::with_environment(tx, "dev".to_string());
        reporter.emit_detailed(
            40,
            "Executing apt-get update".into(),
            Some(Stage::Bootstrapping),
            Some("apt-get update".into()),
        );
        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.percentage, 40);
        assert_eq!(progress.environment.as_deref(), Some("dev"));
        assert_eq!(progress.stage, Some(Stage::Bootstrapping));
        assert_eq!(progress.task_name.as_deref(), Some("apt-get update"));

        // a full channel drops the event instead of blocking
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let reporter = ChannelProgressReporter::new(tx);
        reporter.emit(10, "first".into());
        reporter.emit(250, "second".into());
        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert!(rx.try_recv().is_err());
    }
}
