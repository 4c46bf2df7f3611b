//! Node bootstrap coordinator
//!
//! Drives each node through `Launching -> WaitingForSsh -> Bootstrapping
//! -> Ready/Joined`. The main node must be `Ready` before any worker may
//! become `Joined`; workers then bootstrap concurrently.

use crate::credential::{JoinCredential, parse_join_command};
use crate::error::{BootstrapError, Result};
use crate::node::{BootstrapState, BootstrapTrace, NodeTarget};
use crate::payload::{
    KUBELET_CONF, MAIN_SIGNAL, PAYLOAD_LOG, PAYLOAD_PATH, STARTED_MARKER, WORKER_SIGNAL,
    completion_signal, payload_for,
};
use crate::remote::{CommandOutput, RemoteExecutor};
use clusterflow_cloud::NodeRole;
use clusterflow_config::TimeoutConfig;
use futures_util::stream::{self, StreamExt};
use regex::{NoExpand, Regex};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TOKEN_CREATE: &str = "sudo kubeadm token create --print-join-command";

/// Attempts for single commands when the host drops the connection
const EXEC_ATTEMPTS: u32 = 3;

/// Bounds for every wait the coordinator performs
#[derive(Debug, Clone)]
pub struct BootstrapTimeouts {
    pub ssh: Duration,
    pub poll_interval: Duration,
    pub control_plane: Duration,
    pub join_credential: Duration,
    pub worker_ready: Duration,
    pub join: Duration,
}

impl From<&TimeoutConfig> for BootstrapTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            ssh: config.ssh(),
            poll_interval: config.ssh_retry_interval(),
            control_plane: config.control_plane(),
            join_credential: config.join_credential(),
            worker_ready: config.worker_ready(),
            join: config.join(),
        }
    }
}

impl Default for BootstrapTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

/// Parameters only the main payload receives
#[derive(Debug, Clone)]
pub struct MainParams {
    pub node_name: String,
    pub pod_network_cidr: String,
    /// Login user that receives a copy of the admin kubeconfig
    pub ssh_user: String,
}

/// Result of a successful main bootstrap
#[derive(Debug, Clone)]
pub struct MainOutcome {
    pub credential: JoinCredential,
    /// Admin kubeconfig pointing at the node's public address
    pub kubeconfig: String,
}

/// Result of one worker bootstrap
#[derive(Debug)]
pub struct WorkerOutcome {
    pub node: NodeTarget,
    pub result: Result<()>,
}

pub struct BootstrapCoordinator<E: RemoteExecutor + ?Sized> {
    executor: Arc<E>,
    timeouts: BootstrapTimeouts,
    max_parallel: usize,
    trace: BootstrapTrace,
    cancel: CancellationToken,
}

impl<E: RemoteExecutor + ?Sized> BootstrapCoordinator<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self {
            executor,
            timeouts: BootstrapTimeouts::default(),
            max_parallel: 8,
            trace: BootstrapTrace::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: BootstrapTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = limit.max(1);
        self
    }

    pub fn with_trace(mut self, trace: BootstrapTrace) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn trace(&self) -> &BootstrapTrace {
        &self.trace
    }

    /// Initialize the control plane and collect the join credential and
    /// admin kubeconfig
    pub async fn bootstrap_main(&self, node: &NodeTarget, params: &MainParams) -> Result<MainOutcome> {
        let mut progress = Progress::new(node);
        let result = self.run_main(&mut progress, node, params).await;
        self.settle(&mut progress, result)
    }

    /// Bring one worker up and join it with `credential`
    pub async fn bootstrap_worker(&self, node: &NodeTarget, credential: &JoinCredential) -> Result<()> {
        let mut progress = Progress::new(node);
        let result = self.run_worker(&mut progress, node, credential).await;
        self.settle(&mut progress, result)
    }

    /// Bootstrap workers concurrently, at most `max_parallel` at a time.
    /// One worker failing does not stop the others.
    pub async fn bootstrap_workers(
        &self,
        nodes: &[NodeTarget],
        credential: &JoinCredential,
    ) -> Vec<WorkerOutcome> {
        stream::iter(nodes.iter().cloned())
            .map(move |node| async move {
                let result = self.bootstrap_worker(&node, credential).await;
                WorkerOutcome { node, result }
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await
    }

    async fn run_main(
        &self,
        progress: &mut Progress,
        node: &NodeTarget,
        params: &MainParams,
    ) -> Result<MainOutcome> {
        progress.advance(&self.trace, BootstrapState::WaitingForSsh)?;
        self.wait_for_ssh(node).await?;

        progress.advance(&self.trace, BootstrapState::Bootstrapping)?;
        let mut env = vec![
            ("PUBLIC_IP", node.public_ip.clone()),
            ("NODE_NAME", params.node_name.clone()),
            ("POD_NETWORK_CIDR", params.pod_network_cidr.clone()),
            ("SSH_USER", params.ssh_user.clone()),
        ];
        if let Some(private_ip) = &node.private_ip {
            env.push(("PRIVATE_IP", private_ip.clone()));
        }
        self.start_payload(node, &env).await?;
        self.wait_for_file(node, MAIN_SIGNAL, "control plane", self.timeouts.control_plane)
            .await?;

        let credential = self.fetch_credential(node).await?;
        let kubeconfig = self.fetch_kubeconfig(node).await?;

        progress.advance(&self.trace, BootstrapState::Ready)?;
        tracing::info!("Control plane ready on {} ({})", node.name, node.public_ip);
        Ok(MainOutcome {
            credential,
            kubeconfig,
        })
    }

    async fn run_worker(
        &self,
        progress: &mut Progress,
        node: &NodeTarget,
        credential: &JoinCredential,
    ) -> Result<()> {
        if credential.is_empty() {
            return Err(BootstrapError::InvalidCredential(
                "empty join credential".to_string(),
            ));
        }

        progress.advance(&self.trace, BootstrapState::WaitingForSsh)?;
        self.wait_for_ssh(node).await?;

        progress.advance(&self.trace, BootstrapState::Bootstrapping)?;
        if self.file_exists(node, KUBELET_CONF).await? {
            tracing::info!("{} has already joined", node.name);
            return progress.advance(&self.trace, BootstrapState::Joined);
        }

        self.start_payload(node, &[]).await?;
        self.wait_for_file(node, WORKER_SIGNAL, "worker payload", self.timeouts.worker_ready)
            .await?;

        if !self.trace.main_ready() {
            return Err(BootstrapError::InvalidTransition {
                node: node.name.clone(),
                from: progress.state,
                to: BootstrapState::Joined,
            });
        }
        self.join(node, credential).await?;

        progress.advance(&self.trace, BootstrapState::Joined)?;
        tracing::info!("{} joined the cluster", node.name);
        Ok(())
    }

    fn settle<T>(&self, progress: &mut Progress, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracing::error!("Bootstrap of {} failed: {}", progress.node, err);
            if !progress.state.is_terminal() {
                let _ = progress.advance(&self.trace, BootstrapState::Failed);
            }
        }
        result
    }

    async fn wait_for_ssh(&self, node: &NodeTarget) -> Result<()> {
        tracing::info!("Waiting for SSH on {} ({})", node.name, node.public_ip);
        let wait = Wait::new(node, "ssh", self.timeouts.ssh);
        loop {
            match self
                .within(&wait, self.executor.check_connection(&node.public_ip))
                .await
            {
                Ok(()) => return Ok(()),
                Err(BootstrapError::Unreachable { message, .. }) => {
                    tracing::debug!("SSH not ready on {}: {}", node.name, message);
                }
                Err(err) => return Err(err),
            }
            self.pause(&wait).await?;
        }
    }

    /// Upload and start the payload unless it already ran or is running
    async fn start_payload(&self, node: &NodeTarget, env: &[(&str, String)]) -> Result<()> {
        if self.file_exists(node, completion_signal(node.role)).await? {
            tracing::info!("Payload already completed on {}", node.name);
            return Ok(());
        }
        if self.file_exists(node, STARTED_MARKER).await? {
            if self.payload_running(node).await? {
                tracing::info!("Payload already running on {}", node.name);
                return Ok(());
            }
            tracing::warn!("Payload on {} stopped before completing, restarting it", node.name);
        }

        tracing::info!("Starting {} payload on {}", node.role, node.name);
        self.cancellable(self.executor.upload(
            &node.public_ip,
            PAYLOAD_PATH,
            &payload_for(node.role),
            "0755",
        ))
        .await?;

        let command = start_command(env);
        let output = self.run(node, &command).await?;
        if !output.success() {
            return Err(command_failed(node, "start payload", output));
        }
        Ok(())
    }

    async fn payload_running(&self, node: &NodeTarget) -> Result<bool> {
        let command = running_command();
        let output = self.run(node, &command).await?;
        match output.status {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(command_failed(node, &command, output)),
        }
    }

    async fn wait_for_file(
        &self,
        node: &NodeTarget,
        path: &str,
        phase: &'static str,
        timeout: Duration,
    ) -> Result<()> {
        tracing::info!("Waiting for {} on {}", phase, node.name);
        let wait = Wait::new(node, phase, timeout);
        let command = test_command(path);
        loop {
            match self
                .within(&wait, self.executor.exec(&node.public_ip, &command))
                .await
            {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) if output.status == 1 => {}
                Ok(output) => return Err(command_failed(node, &command, output)),
                Err(BootstrapError::Unreachable { .. }) => {}
                Err(err) => return Err(err),
            }
            self.pause(&wait).await?;
        }
    }

    /// The API server may lag behind admin.conf; keep asking until the
    /// credential timeout
    async fn fetch_credential(&self, node: &NodeTarget) -> Result<JoinCredential> {
        let wait = Wait::new(node, "join credential", self.timeouts.join_credential);
        loop {
            match self
                .within(&wait, self.executor.exec(&node.public_ip, TOKEN_CREATE))
                .await
            {
                Ok(output) if output.success() => return parse_join_command(&output.stdout),
                Ok(output) => {
                    tracing::debug!("Join credential not ready: {}", output.stderr.trim());
                }
                Err(BootstrapError::Unreachable { .. }) => {}
                Err(err) => return Err(err),
            }
            self.pause(&wait).await?;
        }
    }

    async fn fetch_kubeconfig(&self, node: &NodeTarget) -> Result<String> {
        let command = format!("sudo cat {}", MAIN_SIGNAL);
        let output = self.run(node, &command).await?;
        if !output.success() {
            return Err(command_failed(node, &command, output));
        }
        rewrite_api_server(&output.stdout, &node.public_ip)
    }

    async fn join(&self, node: &NodeTarget, credential: &JoinCredential) -> Result<()> {
        tracing::info!("Joining {} to {}", node.name, credential.endpoint);
        let wait = Wait::new(node, "join", self.timeouts.join);
        let output = self
            .within(
                &wait,
                self.executor
                    .exec(&node.public_ip, &credential.join_command()),
            )
            .await?;
        if !output.success() {
            return Err(command_failed(node, "kubeadm join", output));
        }
        Ok(())
    }

    async fn file_exists(&self, node: &NodeTarget, path: &str) -> Result<bool> {
        let command = test_command(path);
        let output = self.run(node, &command).await?;
        match output.status {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(command_failed(node, &command, output)),
        }
    }

    /// Run a short command, retrying dropped connections a few times
    async fn run(&self, node: &NodeTarget, command: &str) -> Result<CommandOutput> {
        let mut attempt = 1;
        loop {
            match self
                .cancellable(self.executor.exec(&node.public_ip, command))
                .await
            {
                Err(BootstrapError::Unreachable { message, .. }) if attempt < EXEC_ATTEMPTS => {
                    tracing::warn!(
                        "{} unreachable (attempt {}/{}): {}",
                        node.name,
                        attempt,
                        EXEC_ATTEMPTS,
                        message
                    );
                    attempt += 1;
                    self.cancellable(async {
                        tokio::time::sleep(self.timeouts.poll_interval).await;
                        Ok(())
                    })
                    .await?;
                }
                other => return other,
            }
        }
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BootstrapError::Cancelled),
            result = fut => result,
        }
    }

    async fn within<T>(&self, wait: &Wait, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BootstrapError::Cancelled),
            result = tokio::time::timeout_at(wait.deadline, fut) => {
                result.unwrap_or_else(|_| Err(wait.expired()))
            }
        }
    }

    async fn pause(&self, wait: &Wait) -> Result<()> {
        let now = Instant::now();
        if now >= wait.deadline {
            return Err(wait.expired());
        }
        let nap = self.timeouts.poll_interval.min(wait.deadline - now);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BootstrapError::Cancelled),
            _ = tokio::time::sleep(nap) => Ok(()),
        }
    }
}

/// State of one node within a single bootstrap call
struct Progress {
    node: String,
    role: NodeRole,
    state: BootstrapState,
}

impl Progress {
    fn new(node: &NodeTarget) -> Self {
        Self {
            node: node.name.clone(),
            role: node.role,
            state: BootstrapState::Launching,
        }
    }

    fn advance(&mut self, trace: &BootstrapTrace, to: BootstrapState) -> Result<()> {
        let gated = to == BootstrapState::Joined && !trace.main_ready();
        if gated || !self.state.can_transition(to, self.role) {
            return Err(BootstrapError::InvalidTransition {
                node: self.node.clone(),
                from: self.state,
                to,
            });
        }
        trace.record(&self.node, self.role, self.state, to);
        self.state = to;
        Ok(())
    }
}

struct Wait {
    node: String,
    phase: &'static str,
    timeout: Duration,
    deadline: Instant,
}

impl Wait {
    fn new(node: &NodeTarget, phase: &'static str, timeout: Duration) -> Self {
        Self {
            node: node.name.clone(),
            phase,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    fn expired(&self) -> BootstrapError {
        BootstrapError::Timeout {
            node: self.node.clone(),
            phase: self.phase.to_string(),
            secs: self.timeout.as_secs(),
        }
    }
}

fn test_command(path: &str) -> String {
    format!("sudo test -f {}", path)
}

/// `pgrep` exits 0 while a payload process is alive. The bracket keeps
/// the pattern from matching the remote shell running `pgrep` itself.
fn running_command() -> String {
    format!("pgrep -f '[b]ash {}'", PAYLOAD_PATH)
}

fn start_command(env: &[(&str, String)]) -> String {
    let mut parts = vec!["nohup sudo env".to_string()];
    parts.extend(env.iter().map(|(key, value)| format!("{}='{}'", key, value)));
    parts.push(format!(
        "bash {} > {} 2>&1 < /dev/null &",
        PAYLOAD_PATH, PAYLOAD_LOG
    ));
    parts.join(" ")
}

fn command_failed(node: &NodeTarget, command: &str, output: CommandOutput) -> BootstrapError {
    BootstrapError::CommandFailed {
        node: node.name.clone(),
        command: command.to_string(),
        status: output.status,
        stderr: output.stderr.trim().to_string(),
    }
}

/// Point the kubeconfig's API server at `public_ip`
pub fn rewrite_api_server(kubeconfig: &str, public_ip: &str) -> Result<String> {
    let server = Regex::new(r"https://[0-9.]+:6443")
        .map_err(|e| BootstrapError::InvalidKubeconfig(format!("pattern: {}", e)))?;
    if !server.is_match(kubeconfig) {
        return Err(BootstrapError::InvalidKubeconfig(
            "no API server address found".to_string(),
        ));
    }
    let replacement = format!("https://{}:6443", public_ip);
    Ok(server
        .replace_all(kubeconfig, NoExpand(&replacement))
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_api_server() {
        let kubeconfig = "clusters:\n- cluster:\n    server: https://10.0.0.10:6443\n  name: kubernetes\n";
        let rewritten = rewrite_api_server(kubeconfig, "198.51.100.4").unwrap();
        assert!(rewritten.contains("server: https://198.51.100.4:6443"));
        assert!(!rewritten.contains("10.0.0.10"));
    }

    #[test]
    fn test_rewrite_requires_server() {
        assert!(rewrite_api_server("apiVersion: v1\n", "198.51.100.4").is_err());
    }

    #[test]
    fn test_start_command() {
        let command = start_command(&[("PUBLIC_IP", "198.51.100.4".to_string())]);
        assert_eq!(
            command,
            "nohup sudo env PUBLIC_IP='198.51.100.4' bash /opt/clusterflow/bootstrap.sh \
             > /tmp/clusterflow-bootstrap.log 2>&1 < /dev/null &"
        );
        assert!(start_command(&[]).starts_with("nohup sudo env bash "));
    }

    #[test]
    fn test_running_command_does_not_match_itself() {
        let command = running_command();
        assert_eq!(command, "pgrep -f '[b]ash /opt/clusterflow/bootstrap.sh'");
        assert!(!command.contains("bash /opt"));
    }

    #[test]
    fn test_timeouts_from_config() {
        let timeouts = BootstrapTimeouts::default();
        assert_eq!(timeouts.ssh, Duration::from_secs(300));
        assert_eq!(timeouts.poll_interval, Duration::from_secs(5));
        assert_eq!(timeouts.control_plane, Duration::from_secs(900));
    }
}
