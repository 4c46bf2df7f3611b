//! In-memory provider for tests
//!
//! Behaves like a well-mannered cloud: ids are assigned on create,
//! instances start running immediately, deleting an unknown id reports
//! not-found. A create repeated with the same client token returns the
//! resource of the first call. Failures can be injected per operation.

use crate::error::{CloudError, Result};
use crate::plan::{ResourceKind, ResourceRole, ResourceSpec};
use crate::provider::{
    AuthStatus, CloudProvider, CreatedResource, InstanceInfo, InstanceState, ResourceContext,
};
use crate::state::Attributes;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Kind of failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Fatal,
    Unreachable,
}

#[derive(Debug, Clone)]
struct MemoryResource {
    kind: ResourceKind,
    state: InstanceState,
    public_ip: Option<String>,
    private_ip: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    resources: BTreeMap<String, MemoryResource>,
    key_pairs: BTreeMap<String, String>,
    failures: Vec<(String, FailureKind, usize)>,
    lost_responses: Vec<(String, usize)>,
    tokens: BTreeMap<String, String>,
    mutations: Vec<String>,
    hold_pending: bool,
}

#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a key pair with this name was imported before
    pub fn with_existing_key_pair(self, key_name: &str) -> Self {
        {
            let mut state = self.state();
            let id = next_id(&mut state, ResourceKind::KeyPair);
            state.key_pairs.insert(key_name.to_string(), id.clone());
            state.resources.insert(id, resource(ResourceKind::KeyPair));
        }
        self
    }

    /// Fail the next `times` calls of `operation` (`create:vpc`,
    /// `configure:route_table`, `delete:instance`, `describe:instance`, ...)
    pub fn fail_next(&self, operation: &str, kind: FailureKind, times: usize) {
        self.state()
            .failures
            .push((operation.to_string(), kind, times));
    }

    /// Carry out the next `times` calls of `operation` but answer them
    /// with a transient error, as when the response is lost in transit
    pub fn lose_next_response(&self, operation: &str, times: usize) {
        self.state().lost_responses.push((operation.to_string(), times));
    }

    /// Keep launched instances in `pending` forever
    pub fn hold_instances_pending(&self, hold: bool) {
        self.state().hold_pending = hold;
    }

    /// Delete a resource behind the orchestrator's back
    pub fn remove_externally(&self, id: &str) {
        let mut state = self.state();
        state.resources.remove(id);
        state.key_pairs.retain(|_, v| v != id);
    }

    /// Every create, configure and delete performed, as `action:kind:id`
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state().mutations.len()
    }

    /// Ids of resources that still exist (terminated instances excluded)
    pub fn live_ids(&self) -> Vec<String> {
        self.state()
            .resources
            .iter()
            .filter(|(_, r)| !r.state.is_gone())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        let mut state = self.state();
        let Some(entry) = state
            .failures
            .iter_mut()
            .find(|(op, _, remaining)| op == operation && *remaining > 0)
        else {
            return Ok(());
        };
        entry.2 -= 1;
        let kind = entry.1;

        Err(match kind {
            FailureKind::Transient => {
                CloudError::transient(operation, "RequestLimitExceeded", "injected")
            }
            FailureKind::Fatal => CloudError::fatal(operation, "UnauthorizedOperation", "injected"),
            FailureKind::Unreachable => CloudError::ProviderUnreachable("injected".to_string()),
        })
    }
}

fn resource(kind: ResourceKind) -> MemoryResource {
    MemoryResource {
        kind,
        state: InstanceState::Running,
        public_ip: None,
        private_ip: None,
    }
}

fn next_id(state: &mut MemoryState, kind: ResourceKind) -> String {
    state.next_id += 1;
    let prefix = match kind {
        ResourceKind::Vpc => "vpc",
        ResourceKind::Subnet => "subnet",
        ResourceKind::InternetGateway => "igw",
        ResourceKind::RouteTable => "rtb",
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::KeyPair => "key",
        ResourceKind::Instance => "i",
    };
    format!("{}-{:08x}", prefix, state.next_id)
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus::ok("memory"))
    }

    async fn create_resource(
        &self,
        ctx: &ResourceContext<'_>,
        spec: &ResourceSpec,
    ) -> Result<CreatedResource> {
        let kind = ctx.role.kind();
        self.check_failure(&format!("create:{}", kind))?;

        let mut state = self.state();

        if let ResourceSpec::KeyPair { key_name, .. } = spec
            && let Some(id) = state.key_pairs.get(key_name)
        {
            return Ok(CreatedResource::adopted(id.clone()));
        }

        if let Some(id) = state.tokens.get(ctx.client_token)
            && state.resources.get(id).is_some_and(|r| !r.state.is_gone())
        {
            return Ok(CreatedResource::new(id.clone()));
        }

        let id = next_id(&mut state, kind);
        let mut entry = resource(kind);
        if kind == ResourceKind::Instance {
            let n = state.next_id;
            entry.public_ip = Some(format!("198.51.100.{}", n % 250 + 1));
            entry.private_ip = Some(format!("10.0.0.{}", n % 250 + 1));
            if state.hold_pending {
                entry.state = InstanceState::Pending;
            }
        }
        if let ResourceSpec::KeyPair { key_name, .. } = spec {
            state.key_pairs.insert(key_name.clone(), id.clone());
        }

        state.resources.insert(id.clone(), entry);
        state.tokens.insert(ctx.client_token.to_string(), id.clone());
        state.mutations.push(format!("create:{}:{}", kind, id));

        let operation = format!("create:{}", kind);
        if let Some(lost) = state
            .lost_responses
            .iter_mut()
            .find(|(op, remaining)| *op == operation && *remaining > 0)
        {
            lost.1 -= 1;
            return Err(CloudError::transient(operation, "RequestTimeout", "response lost"));
        }

        let mut created = CreatedResource::new(id);
        if ctx.role == ResourceRole::KeyPair
            && let ResourceSpec::KeyPair { key_name, .. } = spec
        {
            created = created.with_attribute("key_name", serde_json::json!(key_name));
        }
        Ok(created)
    }

    async fn configure_resource(
        &self,
        ctx: &ResourceContext<'_>,
        _spec: &ResourceSpec,
        id: &str,
    ) -> Result<Attributes> {
        let kind = ctx.role.kind();
        self.check_failure(&format!("configure:{}", kind))?;

        let mut state = self.state();
        if !state.resources.contains_key(id) {
            return Err(CloudError::ResourceNotFound(id.to_string()));
        }
        state.mutations.push(format!("configure:{}:{}", kind, id));

        let mut attributes = Attributes::new();
        match ctx.role {
            ResourceRole::RouteTable => {
                attributes.insert(
                    "association_id".into(),
                    serde_json::json!(format!("rtbassoc-{}", id)),
                );
            }
            ResourceRole::InternetGateway => {
                if let Some(vpc) = ctx.dependency(ResourceRole::Vpc) {
                    attributes.insert("vpc_id".into(), serde_json::json!(vpc));
                }
            }
            _ => {}
        }
        Ok(attributes)
    }

    async fn resource_exists(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        self.check_failure(&format!("exists:{}", kind))?;
        Ok(self
            .state()
            .resources
            .get(id)
            .is_some_and(|r| !r.state.is_gone()))
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<InstanceInfo>> {
        self.check_failure("describe:instance")?;
        Ok(self.state().resources.get(id).map(|r| InstanceInfo {
            state: r.state,
            public_ip: r.public_ip.clone(),
            private_ip: r.private_ip.clone(),
        }))
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        _attributes: &Attributes,
    ) -> Result<()> {
        self.check_failure(&format!("delete:{}", kind))?;

        let mut state = self.state();
        let Some(entry) = state.resources.get_mut(id) else {
            return Err(CloudError::ResourceNotFound(id.to_string()));
        };

        if entry.kind == ResourceKind::Instance {
            if entry.state == InstanceState::Terminated {
                return Ok(());
            }
            entry.state = InstanceState::Terminated;
        } else {
            state.resources.remove(id);
            state.key_pairs.retain(|_, v| v != id);
        }
        state.mutations.push(format!("delete:{}:{}", kind, id));
        Ok(())
    }
}
