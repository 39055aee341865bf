//! Shared fixtures: a scripted command bridge and local artifacts.
#![allow(dead_code)]

use async_trait::async_trait;
use envforge::config::ProvisionerConfig;
use envforge::{BridgeError, CommandBridge, ExecResult, HttpFetcher, Provisioner, Target};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// One command seen by the bridge
#[derive(Debug, Clone)]
pub struct Call {
    pub target: Target,
    pub command: Vec<String>,
}

impl Call {
    pub fn joined(&self) -> String {
        self.command.join(" ")
    }
}

/// In-memory backend. Tracks registered instances for `--list`, `--import`
/// and `--unregister`; anything matching a rule returns the scripted result
/// instead.
#[derive(Default)]
pub struct ScriptedBridge {
    calls: Mutex<Vec<Call>>,
    rules: Mutex<Vec<(String, ExecResult)>>,
    instances: Mutex<Vec<String>>,
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
}

impl ScriptedBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `pattern` exit with `exit_code` and `stderr`.
    pub fn fail_on(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            ExecResult {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn clear_rules(&self) {
        self.rules.lock().unwrap().clear();
    }

    /// Cancel `token` when a command containing `pattern` runs.
    pub fn cancel_on(&self, pattern: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((pattern.to_string(), token));
    }

    pub fn register(&self, name: &str) {
        self.instances.lock().unwrap().push(name.to_string());
    }

    pub fn instances(&self) -> Vec<String> {
        self.instances.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(Call::joined).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Index of the first command containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }
}

#[async_trait]
impl CommandBridge for ScriptedBridge {
    async fn run(&self, target: &Target, command: &[String]) -> Result<ExecResult, BridgeError> {
        if command.is_empty() {
            return Err(BridgeError::EmptyCommand(target.to_string()));
        }
        let call = Call {
            target: target.clone(),
            command: command.to_vec(),
        };
        let joined = call.joined();
        self.calls.lock().unwrap().push(call);

        if let Some((pattern, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if joined.contains(pattern.as_str()) {
                token.cancel();
            }
        }

        if let Some((_, result)) = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
        {
            return Ok(result.clone());
        }

        if *target == Target::ControlPlane {
            let mut instances = self.instances.lock().unwrap();
            match command[0].as_str() {
                "--list" => {
                    if instances.is_empty() {
                        return Ok(ExecResult {
                            exit_code: -1,
                            stdout: String::new(),
                            stderr: "There are no installed distributions.".to_string(),
                        });
                    }
                    return Ok(ExecResult {
                        exit_code: 0,
                        stdout: instances.join("\r\n"),
                        stderr: String::new(),
                    });
                }
                "--import" => instances.push(command[1].clone()),
                "--unregister" => instances.retain(|n| !n.eq_ignore_ascii_case(&command[1])),
                _ => {}
            }
        }

        Ok(ExecResult::default())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write `bytes` under `dir` and return its file:// URL and digest.
pub fn write_artifact(dir: &Path, file_name: &str, bytes: &[u8]) -> (String, String) {
    let path = dir.join(file_name);
    std::fs::write(&path, bytes).expect("write artifact");
    (format!("file://{}", path.display()), sha256_hex(bytes))
}

pub fn config_for(url: &str, digest: &str) -> ProvisionerConfig {
    let mut config = ProvisionerConfig::default();
    config.artifact.url = url.to_string();
    config.artifact.sha256 = digest.to_string();
    config
}

pub fn provisioner(
    app_dir: &Path,
    bridge: Arc<ScriptedBridge>,
    config: ProvisionerConfig,
) -> Provisioner {
    Provisioner::new(config, app_dir, bridge, Arc::new(HttpFetcher::new()))
        .expect("create provisioner")
}

pub fn record_path(app_dir: &Path, name: &str) -> PathBuf {
    app_dir
        .join("environments")
        .join(format!("{}.json", name.to_ascii_lowercase()))
}
