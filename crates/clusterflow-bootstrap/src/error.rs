//! Error types for node bootstrap

use crate::node::BootstrapState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Timed out after {secs}s waiting for {phase} on {node}")]
    Timeout {
        node: String,
        phase: String,
        secs: u64,
    },

    #[error("{node} is unreachable: {message}")]
    Unreachable { node: String, message: String },

    #[error("Command failed on {node} (exit {status}): {command}: {stderr}")]
    CommandFailed {
        node: String,
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Invalid join credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    #[error("Invalid bootstrap transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: BootstrapState,
        to: BootstrapState,
    },

    #[error("Bootstrap cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BootstrapError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
