/// Backend control plane operations built on a command bridge
use crate::artifact::VerifiedArtifact;
use crate::common::{BridgeError, CommandBridge, ExecResult, Target};
use crate::config::BackendConfig;
use std::path::Path;
use std::sync::Arc;

/// What the control plane prints when nothing is registered.
const NO_INSTANCES_MARKER: &str = "no installed distributions";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Listing instances failed (exit {exit_code}): {message}")]
    List { exit_code: i32, message: String },
}

/// Named-instance management through the virtualization control plane.
///
/// Mutating operations return the raw [`ExecResult`]; callers decide what a
/// non-zero exit means for them.
pub struct BackendControl {
    bridge: Arc<dyn CommandBridge>,
    config: BackendConfig,
}

impl BackendControl {
    pub fn new(bridge: Arc<dyn CommandBridge>, config: BackendConfig) -> Self {
        Self { bridge, config }
    }

    pub fn bridge(&self) -> &Arc<dyn CommandBridge> {
        &self.bridge
    }

    /// Target for privileged commands inside an environment
    pub fn privileged_target(&self, name: &str) -> Target {
        Target::guest(name, self.config.privileged_user.clone())
    }

    async fn control(&self, args: &[&str]) -> Result<ExecResult, BridgeError> {
        let command: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.bridge.run(&Target::ControlPlane, &command).await
    }

    /// Names of registered instances.
    ///
    /// The control plane exits non-zero when nothing is registered; that case
    /// reads as empty. Any other non-zero exit is [`BackendError::List`].
    pub async fn list(&self) -> Result<Vec<String>, BackendError> {
        let result = self.control(&["--list", "--quiet"]).await?;
        if !result.success() {
            if reports_no_instances(&result) {
                tracing::debug!("[Backend] No instances registered");
                return Ok(Vec::new());
            }
            tracing::error!(
                "[Backend] Listing exited {}: {}",
                result.exit_code,
                result.last_line()
            );
            return Err(BackendError::List {
                exit_code: result.exit_code,
                message: result.last_line().to_string(),
            });
        }
        Ok(result
            .stdout
            .lines()
            .map(|l| l.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Whether the backend knows an instance by this name (case-insensitive).
    pub async fn contains(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|n| n.eq_ignore_ascii_case(name)))
    }

    pub async fn import(
        &self,
        name: &str,
        storage_path: &Path,
        artifact: &VerifiedArtifact,
    ) -> Result<ExecResult, BridgeError> {
        let storage = storage_path.to_string_lossy();
        let source = artifact.local_path().to_string_lossy();
        let version = self.config.import_version.map(|v| v.to_string());

        let mut args = vec!["--import", name, storage.as_ref(), source.as_ref()];
        if let Some(version) = version.as_deref() {
            args.push("--version");
            args.push(version);
        }
        tracing::info!(
            "[Backend] Importing '{}' into {:?} from {:?}",
            name,
            storage_path,
            artifact.local_path()
        );
        self.control(&args).await
    }

    pub async fn unregister(&self, name: &str) -> Result<ExecResult, BridgeError> {
        tracing::info!("[Backend] Unregistering '{}'", name);
        self.control(&["--unregister", name]).await
    }

    pub async fn terminate(&self, name: &str) -> Result<ExecResult, BridgeError> {
        self.control(&["--terminate", name]).await
    }

    pub async fn set_sparse(&self, name: &str) -> Result<ExecResult, BridgeError> {
        tracing::info!("[Backend] Enabling sparse storage for '{}'", name);
        self.control(&["--manage", name, "--set-sparse", "true"]).await
    }

    /// Write the default login user into the guest's /etc/wsl.conf.
    pub async fn set_default_user(&self, name: &str, user: &str) -> Result<ExecResult, BridgeError> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '[user]\\ndefault=%s\\n' \"$1\" > /etc/wsl.conf".to_string(),
            "sh".to_string(),
            user.to_string(),
        ];
        self.bridge.run(&self.privileged_target(name), &command).await
    }

    pub fn sparse_enabled(&self) -> bool {
        self.config.sparse
    }
}

fn reports_no_instances(result: &ExecResult) -> bool {
    [&result.stdout, &result.stderr]
        .iter()
        .any(|out| out.to_ascii_lowercase().contains(NO_INSTANCES_MARKER))
}
