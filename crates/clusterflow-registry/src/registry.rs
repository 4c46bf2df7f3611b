//! Cluster lifecycle: create, delete, list, kubeconfig

use crate::backend::Backend;
use crate::error::{RegistryError, Result};
use crate::lease::Leases;
use crate::model::{ClusterSummary, CreateOptions, CreateReport, DeleteReport};
use clusterflow_bootstrap::{
    BootstrapCoordinator, BootstrapError, BootstrapTimeouts, MainParams, NodeTarget,
};
use clusterflow_cloud::{
    ClusterLock, CloudError, LockOperation, PlanSummary, ProvisioningDriver, ResourceDescriptor,
    ResourcePlan, ResourceRole, ResourceStatus, RetryConfig, StateStore, build_plan,
};
use clusterflow_config::ClusterConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;

const MAX_NAME_LEN: usize = 40;

/// How often a create checks for a delete requested by another process,
/// and how often that delete checks whether the lock was let go
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Entry point for every lifecycle operation.
///
/// At most one operation owns a cluster name at a time: in-process through
/// a lease, across processes through the lock file in the state directory.
/// A delete cancels an in-flight create of the same name and waits for it
/// to let go. A create in another process is reached through a cancel
/// request next to its lock file.
pub struct ClusterRegistry<B: Backend> {
    backend: B,
    store: StateStore,
    leases: Leases,
    retry: RetryConfig,
    poll_interval: Duration,
    preempt_timeout: Duration,
}

impl<B: Backend> ClusterRegistry<B> {
    pub fn new(backend: B, store: StateStore) -> Self {
        Self {
            backend,
            store,
            leases: Leases::default(),
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(5),
            preempt_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Interval for instance state polling
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long a delete waits for a create in another process to stop
    pub fn with_preempt_timeout(mut self, timeout: Duration) -> Self {
        self.preempt_timeout = timeout;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The plan `create` would realize, and how much of it already exists
    pub async fn plan(&self, name: &str, config: &ClusterConfig) -> Result<(ResourcePlan, PlanSummary)> {
        validate_name(name)?;
        let plan = build_plan(config).map_err(config_error)?;
        let existing = self.store.descriptor(name).await.map_err(state_error)?;
        let summary = plan.summary(existing.as_ref());
        Ok((plan, summary))
    }

    pub async fn create(
        &self,
        name: &str,
        config: &ClusterConfig,
        options: CreateOptions,
    ) -> Result<CreateReport> {
        validate_name(name)?;
        let plan = build_plan(config).map_err(config_error)?;

        let lease = self
            .leases
            .try_claim(name, LockOperation::Create)
            .ok_or_else(|| RegistryError::Busy(name.to_string()))?;
        let lock = self.lock(name, LockOperation::Create).await?;

        let cancel = lease.cancellation();
        let run = self.run_create(name, config, &plan, &options, cancel.clone());
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            () = self.watch_cancel_request(name, &cancel) => run.await,
        };

        release(lock).await;
        result
    }

    pub async fn delete(&self, name: &str) -> Result<DeleteReport> {
        let _lease = self
            .leases
            .claim_preempting(name)
            .await
            .ok_or_else(|| RegistryError::Busy(name.to_string()))?;
        let lock = self.lock_preempting(name).await?;

        let result = self.run_delete(name).await;

        release(lock).await;
        result
    }

    pub async fn list(&self) -> Result<Vec<ClusterSummary>> {
        let descriptors = self.store.list().await.map_err(state_error)?;
        Ok(descriptors
            .iter()
            .map(ClusterSummary::from_descriptor)
            .collect())
    }

    /// Path of the kubeconfig captured when the main node became ready.
    /// Never contacts the cluster.
    pub async fn kubeconfig(&self, name: &str) -> Result<PathBuf> {
        let descriptor = self
            .store
            .descriptor(name)
            .await
            .map_err(state_error)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        match descriptor.kubeconfig_path {
            Some(path) if path.exists() => Ok(path),
            _ => Err(RegistryError::KubeconfigMissing(name.to_string())),
        }
    }

    async fn run_create(
        &self,
        name: &str,
        config: &ClusterConfig,
        plan: &ResourcePlan,
        options: &CreateOptions,
        cancel: CancellationToken,
    ) -> Result<CreateReport> {
        let mut descriptor = match self.store.descriptor(name).await.map_err(state_error)? {
            Some(existing) if existing.is_live() => {
                if !options.resume {
                    return Err(RegistryError::AlreadyExists(name.to_string()));
                }
                if existing.region != config.region {
                    return Err(RegistryError::Config(format!(
                        "cluster '{}' was created in {}, config says {}",
                        name, existing.region, config.region
                    )));
                }
                tracing::info!(
                    "Resuming cluster {} ({} resources recorded)",
                    name,
                    existing.resources.len()
                );
                existing
            }
            _ => ResourceDescriptor::new(name, &config.region),
        };

        tracing::info!("Provisioning cluster {} in {}", name, config.region);
        let provider = self.backend.provider(&config.region).await;
        let driver = ProvisioningDriver::new(provider, self.store.clone())
            .with_retry(self.retry.clone())
            .with_instance_timeout(config.timeouts.instance_running())
            .with_poll_interval(self.poll_interval)
            .with_cancellation(cancel.clone());
        driver
            .apply(plan, &mut descriptor)
            .await
            .map_err(|e| RegistryError::provider(name, e))?;

        self.bootstrap(name, config, &mut descriptor, cancel).await
    }

    async fn bootstrap(
        &self,
        name: &str,
        config: &ClusterConfig,
        descriptor: &mut ResourceDescriptor,
        cancel: CancellationToken,
    ) -> Result<CreateReport> {
        let coordinator = BootstrapCoordinator::new(self.backend.executor(config))
            .with_timeouts(BootstrapTimeouts::from(&config.timeouts))
            .with_max_parallel(config.max_parallel_bootstraps)
            .with_cancellation(cancel);

        // Main node first; nothing joins before it is ready
        let main = node_target(descriptor, ResourceRole::MainInstance)?;
        self.set_status(descriptor, &[ResourceRole::MainInstance], ResourceStatus::Bootstrapping)
            .await?;

        let params = MainParams {
            node_name: format!("{}-main", name),
            pod_network_cidr: config.pod_network_cidr.clone(),
            ssh_user: config.ssh_user.clone(),
        };
        let outcome = match coordinator.bootstrap_main(&main, &params).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.set_status(descriptor, &[ResourceRole::MainInstance], ResourceStatus::Failed)
                    .await?;
                return Err(bootstrap_error(name, &main, descriptor, err));
            }
        };

        let kubeconfig_path = self.store.kubeconfig_path(name);
        write_kubeconfig(&kubeconfig_path, &outcome.kubeconfig).await?;
        descriptor.kubeconfig_path = Some(kubeconfig_path.clone());
        self.set_status(descriptor, &[ResourceRole::MainInstance], ResourceStatus::Ready)
            .await?;
        tracing::info!("Kubeconfig saved to {}", kubeconfig_path.display());

        // Workers, skipping those joined by an earlier run
        let mut roles = BTreeMap::new();
        let mut workers = Vec::new();
        for role in descriptor.instance_roles() {
            let joined = descriptor
                .get(role)
                .is_some_and(|r| r.status == ResourceStatus::Joined);
            if role == ResourceRole::MainInstance || joined {
                continue;
            }
            let target = node_target(descriptor, role)?;
            roles.insert(target.name.clone(), role);
            workers.push(target);
        }

        let pending: Vec<ResourceRole> = roles.values().copied().collect();
        self.set_status(descriptor, &pending, ResourceStatus::Bootstrapping)
            .await?;

        let outcomes = coordinator
            .bootstrap_workers(&workers, &outcome.credential)
            .await;

        let mut failed = Vec::new();
        let mut cancelled = false;
        for worker in &outcomes {
            let Some(role) = roles.get(&worker.node.name).copied() else {
                continue;
            };
            match &worker.result {
                Ok(()) => descriptor.set_status(role, ResourceStatus::Joined),
                Err(err) => {
                    cancelled |= matches!(err, BootstrapError::Cancelled);
                    descriptor.set_status(role, ResourceStatus::Failed);
                    failed.push(format!("{}: {}", role, err));
                }
            }
        }
        self.store
            .save_descriptor(descriptor)
            .await
            .map_err(state_error)?;

        if cancelled {
            return Err(RegistryError::Cancelled(name.to_string()));
        }
        if !failed.is_empty() {
            failed.sort();
            return Err(RegistryError::PartialCreateFailure {
                cluster: name.to_string(),
                joined: finished_nodes(descriptor),
                failed,
            });
        }

        tracing::info!("Cluster {} is ready", name);
        Ok(CreateReport {
            name: name.to_string(),
            kubeconfig_path,
            nodes: descriptor
                .instance_roles()
                .into_iter()
                .filter_map(|role| descriptor.get(role).map(|r| (role, r.status)))
                .collect(),
            trace: coordinator.trace().events(),
        })
    }

    async fn run_delete(&self, name: &str) -> Result<DeleteReport> {
        let mut descriptor = self
            .store
            .descriptor(name)
            .await
            .map_err(state_error)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let removed = descriptor.teardown_order();
        tracing::info!("Deleting cluster {} ({} resources)", name, removed.len());

        let provider = self.backend.provider(&descriptor.region).await;
        let driver = ProvisioningDriver::new(provider, self.store.clone())
            .with_retry(self.retry.clone())
            .with_poll_interval(self.poll_interval);
        driver
            .destroy_all(&mut descriptor)
            .await
            .map_err(|e| RegistryError::provider(name, e))?;

        let kubeconfig = descriptor
            .kubeconfig_path
            .clone()
            .unwrap_or_else(|| self.store.kubeconfig_path(name));
        if kubeconfig.exists() {
            fs::remove_file(&kubeconfig).await?;
        }

        self.store
            .remove_descriptor(name)
            .await
            .map_err(state_error)?;
        tracing::info!("Cluster {} deleted", name);

        Ok(DeleteReport {
            name: name.to_string(),
            removed,
        })
    }

    async fn lock(&self, name: &str, operation: LockOperation) -> Result<ClusterLock> {
        self.store
            .acquire_lock(name, operation)
            .await
            .map_err(|e| lock_error(name, e))
    }

    /// Take the lock for a delete. A create holding it in another process
    /// is asked to stop, then waited for.
    async fn lock_preempting(&self, name: &str) -> Result<ClusterLock> {
        match self.store.acquire_lock(name, LockOperation::Delete).await {
            Ok(lock) => return Ok(lock),
            Err(CloudError::LockError(message)) => {
                let holder = self.store.lock_holder(name).await.map_err(state_error)?;
                if !holder.is_some_and(|h| h.operation == LockOperation::Create) {
                    tracing::warn!("{}", message);
                    return Err(RegistryError::Busy(name.to_string()));
                }
            }
            Err(other) => return Err(state_error(other)),
        }

        tracing::info!("Asking the running create of {} to stop", name);
        self.store.request_cancel(name).await.map_err(state_error)?;

        let deadline = tokio::time::Instant::now() + self.preempt_timeout;
        let result = loop {
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            match self.store.acquire_lock(name, LockOperation::Delete).await {
                Ok(lock) => break Ok(lock),
                Err(CloudError::LockError(_)) if tokio::time::Instant::now() < deadline => {}
                Err(e) => break Err(lock_error(name, e)),
            }
        };

        if let Err(e) = self.store.clear_cancel_request(name).await {
            tracing::warn!("Failed to clear cancel request of {}: {}", name, e);
        }
        result
    }

    /// Resolves once another process asked for this create to stop
    async fn watch_cancel_request(&self, name: &str, cancel: &CancellationToken) {
        loop {
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            if self.store.cancel_requested(name).await {
                tracing::info!("Delete of {} requested by another process", name);
                cancel.cancel();
                return;
            }
        }
    }

    async fn set_status(
        &self,
        descriptor: &mut ResourceDescriptor,
        roles: &[ResourceRole],
        status: ResourceStatus,
    ) -> Result<()> {
        for role in roles {
            descriptor.set_status(*role, status);
        }
        self.store
            .save_descriptor(descriptor)
            .await
            .map_err(state_error)
    }
}

fn lock_error(name: &str, err: CloudError) -> RegistryError {
    match err {
        CloudError::LockError(message) => {
            tracing::warn!("{}", message);
            RegistryError::Busy(name.to_string())
        }
        other => state_error(other),
    }
}

async fn release(lock: ClusterLock) {
    if let Err(e) = lock.release().await {
        tracing::warn!("Failed to release cluster lock: {}", e);
    }
}

/// Cluster names end up in file names and resource tags
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::Config(format!(
            "invalid cluster name '{}': use up to {} lowercase letters, digits and '-'",
            name, MAX_NAME_LEN
        )))
    }
}

fn node_target(descriptor: &ResourceDescriptor, role: ResourceRole) -> Result<NodeTarget> {
    let record = descriptor
        .get(role)
        .ok_or_else(|| RegistryError::State(format!("{} is not recorded", role)))?;
    let node_role = role
        .node_role()
        .ok_or_else(|| RegistryError::State(format!("{} is not an instance", role)))?;
    let public_ip: String = record
        .get_attribute("public_ip")
        .ok_or_else(|| RegistryError::State(format!("{} has no public address", role)))?;

    let mut target = NodeTarget::new(role.to_string(), node_role, public_ip);
    if let Some(private_ip) = record.get_attribute::<String>("private_ip") {
        target = target.with_private_ip(private_ip);
    }
    Ok(target)
}

/// Nodes that reached their final healthy state
fn finished_nodes(descriptor: &ResourceDescriptor) -> Vec<String> {
    descriptor
        .instance_roles()
        .into_iter()
        .filter(|role| {
            descriptor
                .get(*role)
                .is_some_and(|r| matches!(r.status, ResourceStatus::Ready | ResourceStatus::Joined))
        })
        .map(|role| role.to_string())
        .collect()
}

fn bootstrap_error(
    name: &str,
    node: &NodeTarget,
    descriptor: &ResourceDescriptor,
    err: BootstrapError,
) -> RegistryError {
    match err {
        BootstrapError::Cancelled => RegistryError::Cancelled(name.to_string()),
        source => RegistryError::Bootstrap {
            cluster: name.to_string(),
            node: node.name.clone(),
            recorded: descriptor.recorded_summary(),
            source,
        },
    }
}

async fn write_kubeconfig(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

fn config_error(err: CloudError) -> RegistryError {
    match err {
        CloudError::InvalidConfig(message) => RegistryError::Config(message),
        other => RegistryError::Config(other.to_string()),
    }
}

fn state_error(err: CloudError) -> RegistryError {
    RegistryError::State(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        for ok in ["demo", "gpu-lab-2", "a"] {
            assert!(validate_name(ok).is_ok(), "{}", ok);
        }
        let long = "a".repeat(41);
        for bad in ["", "Demo", "-demo", "demo_1", "demo/../x", long.as_str()] {
            assert!(validate_name(bad).is_err(), "{}", bad);
        }
    }
}
