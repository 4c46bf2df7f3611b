//! ClusterFlow Cloud Infrastructure
//!
//! Plans, provisions and tears down the cloud resources of a Kubernetes
//! cluster, keeping a durable descriptor of everything created.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 ClusterFlow CLI                  │
//! │            (clusterflow create/delete)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               clusterflow-cloud                  │
//! │  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │  build_plan  │  │   ProvisioningDriver     │ │
//! │  └──────────────┘  └────────────┬─────────────┘ │
//! │  ┌──────────────┐  ┌────────────▼─────────────┐ │
//! │  │  StateStore  │  │  trait CloudProvider     │ │
//! │  └──────────────┘  └────────────┬─────────────┘ │
//! └─────────────────────────────────┼───────────────┘
//!                                   │
//!                         ┌─────────▼───────┐
//!                         │  aws-ec2        │
//!                         │  provider       │
//!                         └─────────────────┘
//! ```

pub mod driver;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod plan;
pub mod provider;
pub mod retry;
pub mod state;

// Re-exports
pub use driver::ProvisioningDriver;
pub use error::{CloudError, Result};
pub use plan::{
    ActionType, IngressRule, InstanceSpec, NodeRole, PlanStep, PlanSummary, ResourceKind,
    ResourcePlan, ResourceRole, ResourceSpec, build_plan,
};
pub use provider::{
    AuthStatus, CloudProvider, CreatedResource, InstanceInfo, InstanceState, ResourceContext,
};
pub use retry::{RetryConfig, retry_with_backoff};
pub use state::{
    Attributes, ClusterLock, GlobalState, LockHolder, LockOperation, ResourceDescriptor,
    ResourceRecord, ResourceStatus, StateStore,
};
