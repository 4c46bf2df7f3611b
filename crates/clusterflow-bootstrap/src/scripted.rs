//! Scripted remote executor for tests
//!
//! Simulates the hosts a bootstrap talks to: files appear when a payload
//! is started, `kubeadm token create` prints a join command, `kubeadm
//! join` writes the kubelet config. Hosts can be made slow to accept SSH,
//! stalled or broken. A stalled payload stays alive; a crashed one leaves
//! only its start marker behind.

use crate::error::{BootstrapError, Result};
use crate::payload::{KUBELET_CONF, MAIN_SIGNAL, PAYLOAD_PATH, STARTED_MARKER, WORKER_SIGNAL};
use crate::remote::{CommandOutput, RemoteExecutor};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

pub const SCRIPTED_TOKEN: &str = "abcdef.0123456789abcdef";
pub const SCRIPTED_HASH: &str = "sha256:0f1e2d3c4b5a";

#[derive(Default)]
struct Host {
    files: BTreeSet<String>,
    uploads: BTreeMap<String, String>,
    commands: Vec<String>,
    refuse_connections: usize,
    never_reachable: bool,
    stall_payload: bool,
    crash_payload: bool,
    payload_alive: bool,
    fail_join: bool,
    token_failures: usize,
}

#[derive(Default)]
struct Hosts {
    hosts: BTreeMap<String, Host>,
    joined: Vec<String>,
    stall_all: bool,
    crash_all: bool,
    join_failures: usize,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    state: Mutex<Hosts>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the first `times` connection checks to `host`
    pub fn refuse_connections(&self, host: &str, times: usize) {
        self.host(host, |h| h.refuse_connections = times);
    }

    pub fn never_reachable(&self, host: &str) {
        self.host(host, |h| h.never_reachable = true);
    }

    /// The payload starts but never signals completion
    pub fn stall_payload(&self, host: &str) {
        self.host(host, |h| h.stall_payload = true);
    }

    /// The next payload started on `host` exits after writing its start
    /// marker
    pub fn crash_payload(&self, host: &str) {
        self.host(host, |h| h.crash_payload = true);
    }

    pub fn fail_join(&self, host: &str) {
        self.host(host, |h| h.fail_join = true);
    }

    /// Stall the payload on every host (or stop doing so)
    pub fn stall_all_payloads(&self, stall: bool) {
        self.state().stall_all = stall;
    }

    /// Crash the payload on every host (or stop doing so)
    pub fn crash_all_payloads(&self, crash: bool) {
        self.state().crash_all = crash;
    }

    /// Fail the next `times` joins, whichever hosts they come from
    pub fn fail_next_joins(&self, times: usize) {
        self.state().join_failures = times;
    }

    /// `kubeadm token create` fails the first `times` calls
    pub fn fail_token(&self, host: &str, times: usize) {
        self.host(host, |h| h.token_failures = times);
    }

    /// Put a file on the host as if an earlier run created it
    pub fn with_file(&self, host: &str, path: &str) {
        self.host(host, |h| {
            h.files.insert(path.to_string());
        });
    }

    pub fn commands(&self, host: &str) -> Vec<String> {
        self.state()
            .hosts
            .get(host)
            .map(|h| h.commands.clone())
            .unwrap_or_default()
    }

    pub fn uploaded(&self, host: &str, path: &str) -> Option<String> {
        self.state()
            .hosts
            .get(host)
            .and_then(|h| h.uploads.get(path).cloned())
    }

    /// How often a payload was uploaded to `host`
    pub fn payload_uploads(&self, host: &str) -> usize {
        let upload = format!("upload {}", PAYLOAD_PATH);
        self.commands(host).iter().filter(|c| **c == upload).count()
    }

    /// Hosts that ran `kubeadm join`, in order
    pub fn joined_hosts(&self) -> Vec<String> {
        self.state().joined.clone()
    }

    fn state(&self) -> MutexGuard<'_, Hosts> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn host(&self, host: &str, f: impl FnOnce(&mut Host)) {
        f(self.state().hosts.entry(host.to_string()).or_default());
    }
}

fn unreachable(host: &str) -> BootstrapError {
    BootstrapError::Unreachable {
        node: host.to_string(),
        message: "Connection refused".to_string(),
    }
}

const SCRIPTED_KUBECONFIG: &str = "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: Y2E=
    server: https://10.0.0.10:6443
  name: kubernetes
kind: Config
";

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn check_connection(&self, host: &str) -> Result<()> {
        let mut state = self.state();
        let entry = state.hosts.entry(host.to_string()).or_default();
        if entry.never_reachable {
            return Err(unreachable(host));
        }
        if entry.refuse_connections > 0 {
            entry.refuse_connections -= 1;
            return Err(unreachable(host));
        }
        Ok(())
    }

    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let mut state = self.state();
        let stall_all = state.stall_all;
        let crash_all = state.crash_all;
        let entry = state.hosts.entry(host.to_string()).or_default();
        if entry.never_reachable {
            return Err(unreachable(host));
        }
        entry.commands.push(command.to_string());

        if let Some(path) = command.strip_prefix("sudo test -f ") {
            let status = if entry.files.contains(path) { 0 } else { 1 };
            return Ok(CommandOutput {
                status,
                ..CommandOutput::default()
            });
        }

        if command.starts_with("pgrep -f ") {
            let status = if entry.payload_alive { 0 } else { 1 };
            return Ok(CommandOutput {
                status,
                ..CommandOutput::default()
            });
        }

        if command.contains(&format!("bash {}", PAYLOAD_PATH)) {
            entry.files.insert(STARTED_MARKER.to_string());
            entry.payload_alive = false;
            if entry.crash_payload || crash_all {
                entry.crash_payload = false;
            } else if entry.stall_payload || stall_all {
                entry.payload_alive = true;
            } else {
                let is_main = entry
                    .uploads
                    .get(PAYLOAD_PATH)
                    .is_some_and(|script| script.contains("kubeadm init"));
                let signal = if is_main { MAIN_SIGNAL } else { WORKER_SIGNAL };
                entry.files.insert(signal.to_string());
            }
            return Ok(CommandOutput::ok(""));
        }

        if command.starts_with("sudo kubeadm token create") {
            if entry.token_failures > 0 {
                entry.token_failures -= 1;
                return Ok(CommandOutput::failed(1, "connection to the server was refused"));
            }
            return Ok(CommandOutput::ok(format!(
                "kubeadm join 10.0.0.10:6443 --token {} --discovery-token-ca-cert-hash {} \n",
                SCRIPTED_TOKEN, SCRIPTED_HASH
            )));
        }

        if command == format!("sudo cat {}", MAIN_SIGNAL) {
            if !entry.files.contains(MAIN_SIGNAL) {
                return Ok(CommandOutput::failed(1, "No such file or directory"));
            }
            return Ok(CommandOutput::ok(SCRIPTED_KUBECONFIG));
        }

        if command.starts_with("sudo kubeadm join") {
            if entry.fail_join {
                return Ok(CommandOutput::failed(1, "error execution phase preflight"));
            }
            if state.join_failures > 0 {
                state.join_failures -= 1;
                return Ok(CommandOutput::failed(1, "error execution phase kubelet-start"));
            }
            if let Some(entry) = state.hosts.get_mut(host) {
                entry.files.insert(KUBELET_CONF.to_string());
            }
            state.joined.push(host.to_string());
            return Ok(CommandOutput::ok(""));
        }

        Ok(CommandOutput::failed(127, "command not found"))
    }

    async fn upload(&self, host: &str, path: &str, contents: &str, _mode: &str) -> Result<()> {
        let mut state = self.state();
        let entry = state.hosts.entry(host.to_string()).or_default();
        if entry.never_reachable {
            return Err(unreachable(host));
        }
        entry.commands.push(format!("upload {}", path));
        entry.uploads.insert(path.to_string(), contents.to_string());
        Ok(())
    }
}
