//! Environment provisioner
//!
//! `install` runs every stage from artifact verification to `Ready`;
//! `update` re-enters an existing environment at bootstrapping. Each stage
//! transition is persisted by the registry before the next stage starts, and
//! the cancellation token is only consulted between stages.

use super::tasks::ExecTask;
use super::workflow::{run_tasks, StageResult, TaskExecutor};
use crate::artifact::{ArtifactFetcher, ArtifactRef, IntegrityVerifier, VerifiedArtifact};
use crate::bridge::{BackendControl, BackendError};
use crate::common::{BridgeError, CommandBridge, Stage};
use crate::config::ProvisionerConfig;
use crate::provisioner::{ProgressReporter, ProvisionError, StageFailure, TracingProgressReporter};
use crate::registry::{validate_name, Environment, EnvironmentRegistry, EnvironmentState, NameLocks};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Progress checkpoints (percent)
const VERIFY_DONE: u32 = 15;
const INSTANTIATE_DONE: u32 = 30;
const BOOTSTRAP_DONE: u32 = 70;
const CONFIGURE_RUN_DONE: u32 = 90;

/// Longest accepted guest user name
const MAX_USER_LEN: usize = 32;

/// Check a guest user name: lowercase letters, digits, `_` and `-`,
/// starting with a letter or `_`.
pub fn validate_user(user: &str) -> Result<(), ProvisionError> {
    let invalid = |reason: &str| {
        ProvisionError::Config(format!("invalid user name '{}': {}", user, reason))
    };

    let first = user.chars().next().ok_or_else(|| invalid("must not be empty"))?;
    if user.len() > MAX_USER_LEN {
        return Err(invalid("longer than 32 characters"));
    }
    if !(first.is_ascii_lowercase() || first == '_') {
        return Err(invalid("must start with a lowercase letter or '_'"));
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(invalid("only lowercase letters, digits, '_' and '-' are allowed"));
    }
    Ok(())
}

pub struct Provisioner {
    config: ProvisionerConfig,
    storage_root: PathBuf,
    verifier: IntegrityVerifier,
    registry: Arc<EnvironmentRegistry>,
    backend: Arc<BackendControl>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    runs: NameLocks,
}

impl Provisioner {
    /// Wire the verifier, backend and registry under `app_dir`.
    pub fn new(
        config: ProvisionerConfig,
        app_dir: &Path,
        bridge: Arc<dyn CommandBridge>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self, ProvisionError> {
        let backend = Arc::new(BackendControl::new(bridge, config.backend.clone()));
        let registry = Arc::new(EnvironmentRegistry::open(
            app_dir.join("environments"),
            backend.clone(),
        )?);
        let verifier = IntegrityVerifier::new(config.cache_dir(app_dir), fetcher)?;
        let storage_root = config.storage_root(app_dir);

        Ok(Self {
            config,
            storage_root,
            verifier,
            registry,
            backend,
            reporter: Arc::new(TracingProgressReporter),
            cancel: CancellationToken::new(),
            runs: NameLocks::new(),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Verify the configured artifact without touching any environment.
    pub async fn verify_artifact(&self) -> Result<VerifiedArtifact, ProvisionError> {
        let artifact = ArtifactRef::new(
            self.config.artifact.url.clone(),
            self.config.artifact.sha256.clone(),
        );
        Ok(self.verifier.verify(&artifact).await?)
    }

    /// Provision `name` from scratch, replacing any existing environment.
    ///
    /// The artifact is verified before anything is destroyed.
    pub async fn install(&self, name: &str, user: &str) -> Result<Environment, ProvisionError> {
        validate_name(name)?;
        validate_user(user)?;
        let _run = self.runs.lock(&name.to_ascii_lowercase()).await;
        let start = std::time::Instant::now();
        tracing::info!("[Pipeline] Installing '{}' for user '{}'", name, user);

        self.checkpoint(Stage::ArtifactVerifying)?;
        self.progress(0, "Verifying artifact", Stage::ArtifactVerifying, None);
        let artifact = self.verify_artifact().await.map_err(|e| {
            tracing::error!("[Pipeline] Verification for '{}' failed: {}", name, e);
            e
        })?;
        self.progress(VERIFY_DONE, "Artifact verified", Stage::ArtifactVerifying, None);

        self.checkpoint(Stage::Instantiating)?;
        self.replace_existing(name).await?;

        let storage_path = self.storage_root.join(name);
        self.registry
            .create(name, storage_path.clone(), &artifact)
            .await?;
        self.instantiate(name, &storage_path, &artifact).await?;

        self.checkpoint(Stage::Bootstrapping)?;
        self.registry
            .set_state(name, EnvironmentState::Bootstrapping)
            .await?;
        let env = self.bootstrap_and_configure(name, user).await?;

        tracing::info!(
            "[TIMING] Install of '{}' completed in {}ms",
            name,
            start.elapsed().as_millis()
        );
        Ok(env)
    }

    /// Re-run bootstrap and configuration on an existing environment.
    pub async fn update(&self, name: &str, user: &str) -> Result<Environment, ProvisionError> {
        validate_name(name)?;
        validate_user(user)?;
        let _run = self.runs.lock(&name.to_ascii_lowercase()).await;
        let start = std::time::Instant::now();
        tracing::info!("[Pipeline] Updating '{}' for user '{}'", name, user);

        self.checkpoint(Stage::Bootstrapping)?;
        self.registry.begin_update(name).await?;
        let env = self.bootstrap_and_configure(name, user).await?;

        tracing::info!(
            "[TIMING] Update of '{}' completed in {}ms",
            name,
            start.elapsed().as_millis()
        );
        Ok(env)
    }

    /// Tear down the backend instance and drop the record.
    pub async fn teardown(&self, name: &str) -> Result<(), ProvisionError> {
        validate_name(name)?;
        let _run = self.runs.lock(&name.to_ascii_lowercase()).await;
        self.registry.remove(name).await?;
        Ok(())
    }

    async fn replace_existing(&self, name: &str) -> Result<(), ProvisionError> {
        let has_record = self.registry.exists(name).await;
        let in_backend = self.backend.contains(name).await.map_err(|e| match e {
            BackendError::Bridge(source) => ProvisionError::Bridge {
                stage: Stage::Instantiating,
                source,
            },
            BackendError::List { exit_code, message } => StageFailure::new(
                Stage::Instantiating,
                Some(exit_code),
                format!("Could not list existing instances: {}", message),
            )
            .into(),
        })?;

        if has_record || in_backend {
            tracing::info!("[Pipeline] Replacing existing environment '{}'", name);
            self.progress(
                VERIFY_DONE,
                &format!("Removing existing environment {}", name),
                Stage::Instantiating,
                None,
            );
            self.registry.remove(name).await?;
        }
        Ok(())
    }

    async fn instantiate(
        &self,
        name: &str,
        storage_path: &Path,
        artifact: &VerifiedArtifact,
    ) -> Result<(), ProvisionError> {
        let stage = Stage::Instantiating;
        self.registry
            .set_state(name, EnvironmentState::Instantiating)
            .await?;
        self.progress(VERIFY_DONE, "Importing environment", stage, None);

        let step_start = std::time::Instant::now();
        let outcome = async {
            tokio::fs::create_dir_all(storage_path).await.map_err(|e| {
                StageFailure::new(
                    stage,
                    None,
                    format!("Failed to create storage directory {:?}: {}", storage_path, e),
                )
            })?;
            let result = self
                .backend
                .import(name, storage_path, artifact)
                .await
                .map_err(|source| ProvisionError::Bridge { stage, source })?;
            StageResult::from_exec(stage, "Import", &result).into_result()?;
            Ok::<(), ProvisionError>(())
        }
        .await;
        self.record_failure(name, outcome).await?;
        tracing::info!(
            "[TIMING] Import of '{}' completed in {}ms",
            name,
            step_start.elapsed().as_millis()
        );

        self.registry
            .set_state(name, EnvironmentState::Instantiated)
            .await?;
        self.progress(INSTANTIATE_DONE, "Environment imported", stage, None);
        Ok(())
    }

    /// Expects the record in `Bootstrapping`.
    async fn bootstrap_and_configure(
        &self,
        name: &str,
        user: &str,
    ) -> Result<Environment, ProvisionError> {
        let executor = TaskExecutor::new(
            self.backend.bridge().clone(),
            self.backend.privileged_target(name),
        );

        let bootstrap: Vec<ExecTask> = self
            .config
            .bootstrap
            .steps
            .iter()
            .map(ExecTask::from_step)
            .collect();
        let outcome = run_tasks(
            &bootstrap,
            &executor,
            Stage::Bootstrapping,
            INSTANTIATE_DONE,
            BOOTSTRAP_DONE,
            |pct, msg, task| self.progress(pct, msg, Stage::Bootstrapping, Some(task)),
        )
        .await;
        self.record_failure(name, outcome).await?;

        self.checkpoint(Stage::Configuring)?;
        self.registry
            .set_state(name, EnvironmentState::Configuring)
            .await?;

        let runner = vec![ExecTask::new(
            "configure",
            self.config.configure.command_for(user),
        )];
        let outcome = async {
            run_tasks(
                &runner,
                &executor,
                Stage::Configuring,
                BOOTSTRAP_DONE,
                CONFIGURE_RUN_DONE,
                |pct, msg, task| self.progress(pct, msg, Stage::Configuring, Some(task)),
            )
            .await?;
            self.finalize(name, user).await
        }
        .await;
        self.record_failure(name, outcome).await?;

        let env = self.registry.mark_ready(name, user).await?;
        self.progress(100, &format!("{} is ready", name), Stage::Configuring, None);
        tracing::info!("[Pipeline] '{}' is ready (default user '{}')", name, user);
        Ok(env)
    }

    /// Default user, restart and sparse storage.
    async fn finalize(&self, name: &str, user: &str) -> Result<(), ProvisionError> {
        let stage = Stage::Configuring;
        let bridge_err = |source: BridgeError| ProvisionError::Bridge { stage, source };

        self.progress(CONFIGURE_RUN_DONE, "Setting default user", stage, None);
        let result = self
            .backend
            .set_default_user(name, user)
            .await
            .map_err(bridge_err)?;
        StageResult::from_exec(stage, "Setting default user", &result).into_result()?;

        let result = self.backend.terminate(name).await.map_err(bridge_err)?;
        StageResult::from_exec(stage, "Terminate", &result).into_result()?;

        if self.backend.sparse_enabled() {
            let result = self.backend.set_sparse(name).await.map_err(bridge_err)?;
            StageResult::from_exec(stage, "Enabling sparse storage", &result).into_result()?;
        }
        Ok(())
    }

    /// Persist a stage failure as `Failed{stage, reason}` and pass it on.
    async fn record_failure(
        &self,
        name: &str,
        outcome: Result<(), ProvisionError>,
    ) -> Result<(), ProvisionError> {
        let err = match outcome {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if let Some(stage) = err.failed_stage() {
            tracing::error!("[Pipeline] '{}' failed during {}: {}", name, stage, err);
            self.progress(100, &format!("Failed: {}", err), stage, None);
            if let Err(persist_err) = self.registry.fail(name, stage, err.to_string()).await {
                tracing::error!(
                    "[Pipeline] Could not record failure of '{}': {}",
                    name,
                    persist_err
                );
            }
        }
        Err(err)
    }

    fn checkpoint(&self, next: Stage) -> Result<(), ProvisionError> {
        if self.cancel.is_cancelled() {
            tracing::warn!("[Pipeline] Cancelled before {}", next);
            return Err(ProvisionError::Cancelled(next));
        }
        Ok(())
    }

    fn progress(&self, percentage: u32, message: &str, stage: Stage, task: Option<&str>) {
        self.reporter.emit_detailed(
            percentage,
            message.to_string(),
            Some(stage),
            task.map(str::to_string),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names() {
        for ok in ["alice", "_svc", "dev-user2"] {
            validate_user(ok).unwrap();
        }
        let long = "a".repeat(33);
        for bad in ["", "Alice", "1user", "a b", "x;rm", long.as_str()] {
            assert!(validate_user(bad).is_err(), "{bad:?} accepted");
        }
    }
}
