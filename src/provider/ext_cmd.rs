//! External command execution
//!
//! Backend providers shell out to system utilities. The trait seam exists
//! so that parsing and process logic can be tested against canned command
//! output without touching the host system.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured outcome of one external command
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub status_ok: bool,
    /// The executed command line, kept for error reports
    pub command: String,
}

impl CmdOutput {
    /// Fail with a backend error carrying the command line if the command
    /// exited unsuccessfully
    pub fn require_ok(&self) -> Result<()> {
        if self.status_ok {
            Ok(())
        } else {
            Err(Error::storage_cmd(
                format!("external command failed: {}", self.stderr.trim()),
                self.command.clone(),
            ))
        }
    }
}

/// Executes external commands
#[async_trait]
pub trait ExtCmd: Send + Sync {
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;
}

/// Runs external commands through tokio's process API
#[derive(Debug, Default)]
pub struct TokioExtCmd;

impl TokioExtCmd {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExtCmd for TokioExtCmd {
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let command = format!("{program} {}", args.join(" "));
        debug!(%command, "executing external command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status_ok: output.status.success(),
            command,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned outputs in order, recording the executed command
    /// lines
    pub struct ScriptedExtCmd {
        outputs: Mutex<VecDeque<CmdOutput>>,
        pub executed: Mutex<Vec<String>>,
    }

    impl ScriptedExtCmd {
        pub fn new() -> Self {
            Self {
                outputs: Mutex::new(VecDeque::new()),
                executed: Mutex::new(Vec::new()),
            }
        }

        pub fn push_ok(&self, stdout: &str) {
            self.outputs.lock().push_back(CmdOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                status_ok: true,
                command: String::new(),
            });
        }

        pub fn push_failure(&self, stderr: &str) {
            self.outputs.lock().push_back(CmdOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                status_ok: false,
                command: String::new(),
            });
        }
    }

    #[async_trait]
    impl ExtCmd for ScriptedExtCmd {
        async fn exec(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
            let command = format!("{program} {}", args.join(" "));
            self.executed.lock().push(command.clone());
            let mut output = self
                .outputs
                .lock()
                .pop_front()
                .unwrap_or_else(|| panic!("no scripted output left for: {command}"));
            output.command = command;
            Ok(output)
        }
    }
}
