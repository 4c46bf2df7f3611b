//! Cloud provider trait definition

use crate::error::Result;
use crate::plan::{ResourceKind, ResourceRole, ResourceSpec};
use crate::state::Attributes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cloud provider abstraction trait
///
/// Providers translate provider-neutral [`ResourceSpec`]s into API calls.
/// Ordering, recording, retries and idempotent re-entry are handled by the
/// provisioning driver, so each method performs one logical step.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g., "aws-ec2")
    fn name(&self) -> &str;

    /// Check if the provider is properly configured and authenticated
    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Create the resource and return its identifier as soon as the
    /// provider assigns one. Attachments and rules belong in
    /// [`CloudProvider::configure_resource`].
    async fn create_resource(
        &self,
        ctx: &ResourceContext<'_>,
        spec: &ResourceSpec,
    ) -> Result<CreatedResource>;

    /// Finish a created resource (attach, route, authorize). Must be
    /// idempotent; the returned attributes are merged into the record.
    async fn configure_resource(
        &self,
        ctx: &ResourceContext<'_>,
        spec: &ResourceSpec,
        id: &str,
    ) -> Result<Attributes>;

    /// Whether a recorded resource still exists
    async fn resource_exists(&self, kind: ResourceKind, id: &str) -> Result<bool>;

    /// Current state of an instance, `None` if the provider does not know it
    async fn describe_instance(&self, id: &str) -> Result<Option<InstanceInfo>>;

    /// Delete a resource. `ResourceNotFound` is treated as success by the
    /// caller.
    async fn delete_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> Result<()>;
}

/// What a provider call may need to know about the cluster
#[derive(Debug, Clone)]
pub struct ResourceContext<'a> {
    pub cluster: &'a str,
    pub role: ResourceRole,
    /// Idempotency token of the create. Stays the same across retries and
    /// resumes; changes when the cluster is recreated or a vanished
    /// resource is replaced.
    pub client_token: &'a str,
    /// Identifiers of the roles this step depends on
    pub dependencies: &'a BTreeMap<ResourceRole, String>,
}

impl ResourceContext<'_> {
    pub fn dependency(&self, role: ResourceRole) -> Option<&str> {
        self.dependencies.get(&role).map(String::as_str)
    }

    /// Name tag for the resource (`<cluster>-<suffix>`)
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.cluster, suffix)
    }
}

/// Result of a create call
#[derive(Debug, Clone)]
pub struct CreatedResource {
    pub id: String,
    pub attributes: Attributes,
    /// False when an existing resource was adopted instead of created
    pub managed: bool,
}

impl CreatedResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
            managed: true,
        }
    }

    pub fn adopted(id: impl Into<String>) -> Self {
        Self {
            managed: false,
            ..Self::new(id)
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Instance lifecycle state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl InstanceState {
    pub fn from_provider(state: &str) -> Self {
        match state {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }

    /// The instance will never become running again
    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

/// Instance details returned by describe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}
