//! ClusterFlow node bootstrap
//!
//! Turns running instances into a Kubernetes cluster: waits for SSH,
//! starts the role's payload, initializes the control plane on the main
//! node and joins the workers with the credential it issues.

pub mod coordinator;
pub mod credential;
pub mod error;
pub mod node;
pub mod payload;
pub mod remote;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use coordinator::{
    BootstrapCoordinator, BootstrapTimeouts, MainOutcome, MainParams, WorkerOutcome,
    rewrite_api_server,
};
pub use credential::{JoinCredential, parse_join_command};
pub use error::{BootstrapError, Result};
pub use node::{BootstrapState, BootstrapTrace, NodeTarget, TraceEvent};
pub use payload::payload_for;
pub use remote::{CommandOutput, RemoteExecutor, SshExecutor};
