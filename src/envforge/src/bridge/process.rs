//! Process-backed command bridge
//!
//! Control plane commands run as `<program> <args...>`; guest commands run as
//! `<program> -d <name> -u <user> -- <args...>`.

use crate::common::{BridgeError, CommandBridge, ExecResult, Target};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Runs commands by spawning the backend executable.
pub struct ProcessBridge {
    program: String,
}

impl ProcessBridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn build_command(&self, target: &Target, command: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Target::Guest { name, user } = target {
            cmd.arg("-d").arg(name).arg("-u").arg(user).arg("--");
        }
        cmd.args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl CommandBridge for ProcessBridge {
    async fn run(&self, target: &Target, command: &[String]) -> Result<ExecResult, BridgeError> {
        if command.is_empty() {
            return Err(BridgeError::EmptyCommand(target.to_string()));
        }

        tracing::debug!(
            "[ProcessBridge] {} on {}: {}",
            self.program,
            target,
            command.join(" ")
        );

        let output = self
            .build_command(target, command)
            .output()
            .await
            .map_err(|e| BridgeError::Launch {
                program: self.program.clone(),
                source: e,
            })?;

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: decode_output(&output.stdout),
            stderr: decode_output(&output.stderr),
        };

        if !result.success() {
            tracing::debug!(
                "[ProcessBridge] {} exited {}: {}",
                command.join(" "),
                result.exit_code,
                result.last_line()
            );
        }

        Ok(result)
    }
}

/// Decode process output. `wsl.exe` writes its own messages as UTF-16LE,
/// guest programs write UTF-8.
pub fn decode_output(bytes: &[u8]) -> String {
    let utf16 = if bytes.starts_with(&[0xFF, 0xFE]) {
        Some(&bytes[2..])
    } else if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let pairs = bytes.len() / 2;
        let zero_high = bytes.chunks_exact(2).filter(|p| p[1] == 0 && p[0] != 0).count();
        (zero_high * 2 > pairs).then_some(bytes)
    } else {
        None
    };

    match utf16 {
        Some(body) => {
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|p| u16::from_le_bytes([p[0], p[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => String::from_utf8_lossy(bytes).to_string(),
    }
}
