//! Remote command execution on cluster nodes

use crate::error::{BootstrapError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit status ssh uses for its own connection failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Output of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs commands on a node
///
/// `exec` returns the command's own exit status; failing to reach the
/// host at all is reported as [`BootstrapError::Unreachable`].
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Succeeds once the host accepts a session
    async fn check_connection(&self, host: &str) -> Result<()>;

    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput>;

    /// Write `contents` to `path` (as root) with the given mode
    async fn upload(&self, host: &str, path: &str, contents: &str, mode: &str) -> Result<()> {
        let command = upload_command(path, contents, mode);
        let output = self.exec(host, &command).await?;
        if !output.success() {
            return Err(BootstrapError::CommandFailed {
                node: host.to_string(),
                command: format!("upload {}", path),
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}

fn upload_command(path: &str, contents: &str, mode: &str) -> String {
    let dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".");
    format!(
        "sudo mkdir -p {dir} && echo '{}' | base64 -d | sudo tee {path} > /dev/null && sudo chmod {mode} {path}",
        STANDARD.encode(contents),
    )
}

/// [`RemoteExecutor`] backed by the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn command(&self, host: &str, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg(format!("{}@{}", self.user, host))
            .arg(remote);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, host: &str, remote: &str) -> Result<CommandOutput> {
        tracing::debug!("Running on {}@{}: {}", self.user, host, abbreviate(remote));

        let output = self.command(host, remote).output().await?;
        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if status == SSH_CONNECTION_FAILURE {
            return Err(BootstrapError::Unreachable {
                node: host.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn check_connection(&self, host: &str) -> Result<()> {
        self.run(host, "true").await.map(|_| ())
    }

    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput> {
        self.run(host, command).await
    }
}

/// Keep uploaded payloads out of debug logs
fn abbreviate(command: &str) -> &str {
    match command.char_indices().nth(120) {
        Some((idx, _)) => &command[..idx],
        None => command,
    }
}
