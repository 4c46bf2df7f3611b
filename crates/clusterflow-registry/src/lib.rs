//! ClusterFlow cluster registry
//!
//! The facade behind the CLI. Owns the lifecycle of named clusters:
//!
//! - **create**: plan, provision, bootstrap, capture the kubeconfig
//! - **delete**: tear down in exact reverse creation order
//! - **list** / **kubeconfig**: read-only views of the state directory

pub mod backend;
pub mod error;
mod lease;
pub mod model;
pub mod registry;

pub use backend::*;
pub use error::*;
pub use model::*;
pub use registry::*;
