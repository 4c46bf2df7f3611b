//! Per-node bootstrap state machine and transition trace

use chrono::{DateTime, Utc};
use clusterflow_cloud::NodeRole;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bootstrap phase of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapState {
    Launching,
    WaitingForSsh,
    Bootstrapping,
    /// Control plane initialized, join credential retrievable (main only)
    Ready,
    /// Joined the cluster (workers only)
    Joined,
    Failed,
}

impl BootstrapState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BootstrapState::Ready | BootstrapState::Joined | BootstrapState::Failed
        )
    }

    /// Whether `self -> next` is a legal move for a node of `role`
    pub fn can_transition(&self, next: BootstrapState, role: NodeRole) -> bool {
        use BootstrapState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Launching, WaitingForSsh) => true,
            (WaitingForSsh, Bootstrapping) => true,
            (Bootstrapping, Ready) => role == NodeRole::Main,
            (Bootstrapping, Joined) => role != NodeRole::Main,
            _ => false,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapState::Launching => "launching",
            BootstrapState::WaitingForSsh => "waiting-for-ssh",
            BootstrapState::Bootstrapping => "bootstrapping",
            BootstrapState::Ready => "ready",
            BootstrapState::Joined => "joined",
            BootstrapState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A node to bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    /// Identifier used in traces and errors (the descriptor role key)
    pub name: String,
    pub role: NodeRole,
    /// Address the orchestrator connects to
    pub public_ip: String,
    pub private_ip: Option<String>,
}

impl NodeTarget {
    pub fn new(name: impl Into<String>, role: NodeRole, public_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            public_ip: public_ip.into(),
            private_ip: None,
        }
    }

    pub fn with_private_ip(mut self, private_ip: impl Into<String>) -> Self {
        self.private_ip = Some(private_ip.into());
        self
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub node: String,
    pub role: NodeRole,
    pub from: BootstrapState,
    pub to: BootstrapState,
    pub at: DateTime<Utc>,
}

/// Transitions of every node in one create operation, in the order they
/// happened. Cheap to clone; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct BootstrapTrace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl BootstrapTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: &str, role: NodeRole, from: BootstrapState, to: BootstrapState) {
        tracing::debug!("{}: {} -> {}", node, from, to);
        self.lock().push(TraceEvent {
            node: node.to_string(),
            role,
            from,
            to,
            at: Utc::now(),
        });
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.lock().clone()
    }

    /// Latest state reached by `node`
    pub fn state_of(&self, node: &str) -> Option<BootstrapState> {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.node == node)
            .map(|e| e.to)
    }

    /// Index of the first event moving `node` into `state`
    pub fn position(&self, node: &str, state: BootstrapState) -> Option<usize> {
        self.lock()
            .iter()
            .position(|e| e.node == node && e.to == state)
    }

    /// Whether a main node has reached `Ready`
    pub fn main_ready(&self) -> bool {
        self.lock()
            .iter()
            .any(|e| e.role == NodeRole::Main && e.to == BootstrapState::Ready)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TraceEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
