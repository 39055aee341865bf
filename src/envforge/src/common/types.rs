/// Shared provisioning types
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pipeline stage that can fail.
///
/// `Failed` records carry one of these to say where the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    ArtifactVerifying,
    Instantiating,
    Bootstrapping,
    Configuring,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ArtifactVerifying => "ArtifactVerifying",
            Stage::Instantiating => "Instantiating",
            Stage::Bootstrapping => "Bootstrapping",
            Stage::Configuring => "Configuring",
        }
    }

    /// Stages that run after the environment exists in the backend.
    pub fn is_post_instantiation(&self) -> bool {
        matches!(self, Stage::Bootstrapping | Stage::Configuring)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The backend control plane on the host (list, import, unregister, ...)
    ControlPlane,
    /// Inside a named environment, as the given user
    Guest { name: String, user: String },
}

impl Target {
    pub fn guest(name: impl Into<String>, user: impl Into<String>) -> Self {
        Target::Guest {
            name: name.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::ControlPlane => f.write_str("control-plane"),
            Target::Guest { name, user } => write!(f, "{}@{}", user, name),
        }
    }
}

/// Execution result from a bridged command
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code (-1 when the process was killed by a signal)
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr, falling back to stdout.
    pub fn last_line(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .chain(self.stdout.lines().rev())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("No output available")
    }
}

/// Launch failures. A command that ran and exited non-zero is not an error here.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty command for target {0}")]
    EmptyCommand(String),
}

/// Executes commands against the backend or inside an environment.
///
/// Calls run to completion; there is no retry and no mid-command cancellation.
#[async_trait]
pub trait CommandBridge: Send + Sync {
    async fn run(&self, target: &Target, command: &[String]) -> Result<ExecResult, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_line_prefers_stderr() {
        let result = ExecResult {
            exit_code: 100,
            stdout: "reading lists\n".into(),
            stderr: "E: Unable to locate package\n\n".into(),
        };
        assert_eq!(result.last_line(), "E: Unable to locate package");
    }

    #[test]
    fn last_line_falls_back_to_stdout() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "first\nsecond\n".into(),
            stderr: String::new(),
        };
        assert_eq!(result.last_line(), "second");
        assert_eq!(ExecResult::default().last_line(), "No output available");
    }

    #[test]
    fn target_display() {
        assert_eq!(Target::guest("dev", "root").to_string(), "root@dev");
        assert_eq!(Target::ControlPlane.to_string(), "control-plane");
    }
}
