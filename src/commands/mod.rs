use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured result of a finished shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn failure_message(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("Command failed: {status}")
        } else {
            format!("Command failed: {status}: {stderr}")
        }
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs host-level shell commands. Swapped for a scripted runner in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, limit: Duration) -> Result<CommandOutput, CommandError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, limit: Duration) -> Result<CommandOutput, CommandError> {
        tracing::info!(command, "executing");
        let start = Instant::now();

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::warn!(command, ?limit, "command timed out");
                CommandError::Timeout(limit)
            })??;

        let exit_code = output.status.code();
        tracing::debug!(
            command,
            ?exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "command finished"
        );

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Wraps `value` in single quotes for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    if cfg!(target_os = "windows") {
        return format!("\"{}\"", value.replace('"', "\"\""));
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
