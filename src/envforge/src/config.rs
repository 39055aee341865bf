/// Provisioner configuration
/// Loaded from envforge.toml
use crate::artifact::normalize_digest;
use crate::provisioner::ProvisionError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name searched in the working directory and the app directory
pub const CONFIG_FILE_NAME: &str = "envforge.toml";

/// Provisioner configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvisionerConfig {
    /// Root filesystem image and its trust anchor
    #[serde(default)]
    pub artifact: ArtifactConfig,

    /// Virtualization backend control plane
    #[serde(default)]
    pub backend: BackendConfig,

    /// Where environment disks live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Privileged in-guest setup commands, run in order
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Declarative automation runner
    #[serde(default)]
    pub configure: ConfigureConfig,
}

impl ProvisionerConfig {
    /// Load configuration from an explicit file, or search the usual locations.
    pub fn load(explicit: Option<&Path>, app_dir: &Path) -> Result<Self, ProvisionError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let config_paths = vec![PathBuf::from(CONFIG_FILE_NAME), app_dir.join(CONFIG_FILE_NAME)];

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::warn!("No {} found, using defaults", CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ProvisionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml(&content).map_err(|e| {
            ProvisionError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        tracing::info!("Loaded provisioner config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Check everything an install needs.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        self.validate_artifact()?;
        self.validate_commands()
    }

    /// Artifact URL and digest shape.
    pub fn validate_artifact(&self) -> Result<(), ProvisionError> {
        if self.artifact.url.trim().is_empty() {
            return Err(ProvisionError::Config("artifact.url must be set".to_string()));
        }
        if self.artifact.sha256.trim().is_empty() {
            return Err(ProvisionError::Config(
                "artifact.sha256 must be set (expected SHA-256 of the image)".to_string(),
            ));
        }
        normalize_digest(&self.artifact.sha256)
            .map_err(|e| ProvisionError::Config(format!("artifact.sha256: {}", e)))?;
        Ok(())
    }

    /// Backend, bootstrap and runner settings; enough for an update.
    pub fn validate_commands(&self) -> Result<(), ProvisionError> {
        if self.backend.program.trim().is_empty() {
            return Err(ProvisionError::Config("backend.program must be set".to_string()));
        }
        if self.configure.runner.is_empty() {
            return Err(ProvisionError::Config("configure.runner must not be empty".to_string()));
        }
        if self.configure.playbook.trim().is_empty() {
            return Err(ProvisionError::Config("configure.playbook must be set".to_string()));
        }
        if let Some(step) = self.bootstrap.steps.iter().find(|s| s.command.is_empty()) {
            return Err(ProvisionError::Config(format!(
                "bootstrap step '{}' has an empty command",
                step.name
            )));
        }
        Ok(())
    }

    /// Directory holding downloaded artifacts
    pub fn cache_dir(&self, app_dir: &Path) -> PathBuf {
        self.artifact
            .cache_dir
            .clone()
            .unwrap_or_else(|| app_dir.join("cache"))
    }

    /// Directory under which each environment gets its own storage directory
    pub fn storage_root(&self, app_dir: &Path) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| app_dir.join("instances"))
    }
}

/// Artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// HTTP(S) or file:// URL of the root filesystem tarball
    pub url: String,

    /// Expected SHA-256, hex (optionally prefixed with "sha256:")
    #[serde(default)]
    pub sha256: String,

    /// Cache directory (defaults to <app_dir>/cache)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            url: "https://cloud-images.ubuntu.com/wsl/releases/24.04/current/ubuntu-noble-wsl-amd64-wsl.rootfs.tar.gz".to_string(),
            sha256: String::new(),
            cache_dir: None,
        }
    }
}

/// Backend control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Control plane executable
    #[serde(default = "default_backend_program")]
    pub program: String,

    /// Passed as `--version N` on import when set
    #[serde(default = "default_import_version")]
    pub import_version: Option<u8>,

    /// Switch the environment disk to sparse mode after configuration
    #[serde(default = "default_true")]
    pub sparse: bool,

    /// User for privileged in-guest commands
    #[serde(default = "default_privileged_user")]
    pub privileged_user: String,
}

fn default_backend_program() -> String {
    "wsl.exe".to_string()
}

fn default_import_version() -> Option<u8> {
    Some(2)
}

fn default_true() -> bool {
    true
}

fn default_privileged_user() -> String {
    "root".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: default_backend_program(),
            import_version: default_import_version(),
            sparse: true,
            privileged_user: default_privileged_user(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Defaults to <app_dir>/instances
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub steps: Vec<BootstrapStep>,
}

/// One privileged in-guest command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapStep {
    /// Display name for progress reporting
    pub name: String,
    /// argv executed inside the environment
    pub command: Vec<String>,
}

impl BootstrapStep {
    pub fn new(name: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                BootstrapStep::new(
                    "apt-get update",
                    &["env", "DEBIAN_FRONTEND=noninteractive", "apt-get", "update"],
                ),
                BootstrapStep::new(
                    "apt-get upgrade",
                    &["env", "DEBIAN_FRONTEND=noninteractive", "apt-get", "upgrade", "-y"],
                ),
                BootstrapStep::new(
                    "install ansible",
                    &[
                        "env",
                        "DEBIAN_FRONTEND=noninteractive",
                        "apt-get",
                        "install",
                        "-y",
                        "ansible",
                        "git",
                    ],
                ),
            ],
        }
    }
}

/// Automation runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureConfig {
    /// Runner argv prefix
    #[serde(default = "default_runner")]
    pub runner: Vec<String>,

    /// Playbook path inside the environment
    #[serde(default = "default_playbook")]
    pub playbook: String,

    /// Variable name the target user is passed as
    #[serde(default = "default_user_var")]
    pub user_var: String,

    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_runner() -> Vec<String> {
    vec!["ansible-playbook".to_string()]
}

fn default_playbook() -> String {
    "/etc/envforge/site.yml".to_string()
}

fn default_user_var() -> String {
    "target_user".to_string()
}

impl Default for ConfigureConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            playbook: default_playbook(),
            user_var: default_user_var(),
            extra_args: Vec::new(),
        }
    }
}

impl ConfigureConfig {
    /// Full runner command for a target user.
    pub fn command_for(&self, user: &str) -> Vec<String> {
        let mut command = self.runner.clone();
        command.push(self.playbook.clone());
        command.push("-e".to_string());
        command.push(format!("{}={}", self.user_var, user));
        command.extend(self.extra_args.iter().cloned());
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn empty_file_uses_defaults() {
        let config = ProvisionerConfig::from_toml("").unwrap();
        assert_eq!(config.backend.program, "wsl.exe");
        assert_eq!(config.backend.import_version, Some(2));
        assert_eq!(config.bootstrap.steps.len(), 3);
        assert_eq!(config.configure.runner, vec!["ansible-playbook"]);
    }

    #[test]
    fn defaults_fail_validation_without_digest() {
        let config = ProvisionerConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("artifact.sha256"));
        // updates never touch the artifact
        config.validate_commands().unwrap();
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let config = ProvisionerConfig::from_toml(&format!(
            r#"
            [artifact]
            url = "https://example.com/rootfs.tar.gz"
            sha256 = "{}"

            [backend]
            sparse = false

            [[bootstrap.steps]]
            name = "update"
            command = ["apt-get", "update"]
            "#,
            DIGEST
        ))
        .unwrap();
        config.validate().unwrap();
        assert!(!config.backend.sparse);
        assert_eq!(config.backend.privileged_user, "root");
        assert_eq!(config.bootstrap.steps.len(), 1);
    }

    #[test]
    fn rejects_malformed_digest_and_empty_step() {
        let mut config = ProvisionerConfig::default();
        config.artifact.sha256 = "abc".to_string();
        assert!(config.validate().is_err());

        config.artifact.sha256 = DIGEST.to_string();
        config.bootstrap.steps.push(BootstrapStep::new("noop", &[]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("noop"));
    }

    #[test]
    fn runner_command_passes_user() {
        let configure = ConfigureConfig::default();
        assert_eq!(
            configure.command_for("alice"),
            vec![
                "ansible-playbook",
                "/etc/envforge/site.yml",
                "-e",
                "target_user=alice"
            ]
        );
    }

    #[test]
    fn directories_default_under_app_dir() {
        let config = ProvisionerConfig::default();
        let app_dir = Path::new("/home/u/.envforge");
        assert_eq!(config.cache_dir(app_dir), app_dir.join("cache"));
        assert_eq!(config.storage_root(app_dir), app_dir.join("instances"));
    }
}
