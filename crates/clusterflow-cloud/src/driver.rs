//! Provisioning driver
//!
//! Realizes a [`ResourcePlan`] against a [`CloudProvider`], recording each
//! resource in the descriptor the moment the provider confirms it and
//! flushing the descriptor to the [`StateStore`] after every step. Every
//! operation is safe to repeat: recorded resources are checked for
//! liveness instead of being recreated, and deleting something already gone
//! succeeds.

use crate::error::{CloudError, Result};
use crate::plan::{ActionType, PlanStep, ResourcePlan, ResourceRole};
use crate::provider::{CloudProvider, InstanceState, ResourceContext};
use crate::retry::{RetryConfig, ignore_not_found, retry_with_backoff};
use crate::state::{Attributes, ResourceDescriptor, ResourceRecord, ResourceStatus, StateStore};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Descriptor shared between concurrent launches. The lock is only held
/// while recording and flushing, never across provider calls.
type SharedDescriptor<'a> = Mutex<&'a mut ResourceDescriptor>;

pub struct ProvisioningDriver<P: CloudProvider + ?Sized> {
    provider: Arc<P>,
    store: StateStore,
    retry: RetryConfig,
    instance_timeout: Duration,
    poll_interval: Duration,
    max_concurrent_launches: usize,
    cancel: CancellationToken,
}

impl<P: CloudProvider + ?Sized> ProvisioningDriver<P> {
    pub fn new(provider: Arc<P>, store: StateStore) -> Self {
        Self {
            provider,
            store,
            retry: RetryConfig::default(),
            instance_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            max_concurrent_launches: 8,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Bound on waiting for an instance to reach running (or terminated)
    pub fn with_instance_timeout(mut self, timeout: Duration) -> Self {
        self.instance_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_launches(mut self, limit: usize) -> Self {
        self.max_concurrent_launches = limit.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Ensure one planned role exists and is recorded.
    ///
    /// A role already recorded and still live at the provider is not
    /// recreated; only an unfinished configure or running-wait is resumed.
    pub async fn create_resource(
        &self,
        role: ResourceRole,
        plan: &ResourcePlan,
        descriptor: &mut ResourceDescriptor,
    ) -> Result<()> {
        let shared = Mutex::new(descriptor);
        let result = self.ensure_resource(role, plan, &shared).await;
        let descriptor = shared.into_inner();
        result.map_err(|e| provision_error(ActionType::Create, role, descriptor, e))
    }

    /// Realize the whole plan.
    ///
    /// Networking is created in plan order. Instances are launched
    /// concurrently once their dependencies exist; after a failure no new
    /// launch starts, but launches already in flight finish and are
    /// recorded.
    pub async fn apply(&self, plan: &ResourcePlan, descriptor: &mut ResourceDescriptor) -> Result<()> {
        for step in plan.network_steps() {
            if self.cancel.is_cancelled() {
                return Err(provision_error(
                    ActionType::Create,
                    step.role,
                    descriptor,
                    CloudError::Cancelled,
                ));
            }
            self.create_resource(step.role, plan, descriptor).await?;
        }

        let shared = Mutex::new(descriptor);
        let halted = AtomicBool::new(false);
        let (shared_ref, halted_ref) = (&shared, &halted);

        let results: Vec<(ResourceRole, Result<()>)> = stream::iter(plan.instance_steps())
            .map(|step| async move {
                if halted_ref.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                    return (step.role, Err(CloudError::Cancelled));
                }
                let result = self.ensure_resource(step.role, plan, shared_ref).await;
                if result.is_err() {
                    halted_ref.store(true, Ordering::SeqCst);
                }
                (step.role, result)
            })
            .buffer_unordered(self.max_concurrent_launches)
            .collect()
            .await;

        let descriptor = shared.into_inner();

        // A real failure is reported in preference to the launches it halted
        let mut cancelled = None;
        for (role, result) in results {
            match result {
                Ok(()) => {}
                Err(CloudError::Cancelled) => {
                    cancelled.get_or_insert(role);
                }
                Err(e) => return Err(provision_error(ActionType::Create, role, descriptor, e)),
            }
        }
        if let Some(role) = cancelled {
            return Err(provision_error(
                ActionType::Create,
                role,
                descriptor,
                CloudError::Cancelled,
            ));
        }

        tracing::info!(
            "Provisioned {} resources for {}",
            descriptor.resources.len(),
            descriptor.name
        );
        Ok(())
    }

    /// Delete one recorded role. Absent roles succeed immediately.
    pub async fn destroy_resource(
        &self,
        role: ResourceRole,
        descriptor: &mut ResourceDescriptor,
    ) -> Result<()> {
        let shared = Mutex::new(descriptor);
        let result = async {
            self.begin_destroy(role, &shared).await?;
            self.finish_destroy(role, &shared).await
        }
        .await;
        let descriptor = shared.into_inner();
        result.map_err(|e| provision_error(ActionType::Delete, role, descriptor, e))
    }

    /// Delete everything recorded, latest created first.
    ///
    /// Instance terminations are issued together up front; entries are
    /// still removed strictly in reverse creation order.
    pub async fn destroy_all(&self, descriptor: &mut ResourceDescriptor) -> Result<()> {
        let order = descriptor.teardown_order();
        let instances: Vec<ResourceRole> =
            order.iter().copied().filter(|r| r.is_instance()).collect();

        let shared = Mutex::new(descriptor);

        let issued = join_all(instances.iter().map(|role| self.begin_destroy(*role, &shared))).await;
        let failed = instances
            .iter()
            .zip(issued)
            .find_map(|(role, result)| result.err().map(|e| (*role, e)));
        if let Some((role, e)) = failed {
            let descriptor = shared.into_inner();
            return Err(provision_error(ActionType::Delete, role, descriptor, e));
        }

        for role in order {
            let result = async {
                if !role.is_instance() {
                    self.begin_destroy(role, &shared).await?;
                }
                self.finish_destroy(role, &shared).await
            }
            .await;

            if let Err(e) = result {
                let descriptor = shared.into_inner();
                return Err(provision_error(ActionType::Delete, role, descriptor, e));
            }
        }

        Ok(())
    }

    async fn ensure_resource(
        &self,
        role: ResourceRole,
        plan: &ResourcePlan,
        shared: &SharedDescriptor<'_>,
    ) -> Result<()> {
        let step = plan
            .step(role)
            .ok_or_else(|| CloudError::InvalidConfig(format!("{} is not part of the plan", role)))?;

        let mut replaced = None;
        let existing = shared.lock().await.get(role).cloned();
        if let Some(record) = existing {
            let exists = retry_with_backoff(&self.retry, &format!("check {}", role), || {
                self.provider.resource_exists(record.kind, &record.id)
            })
            .await?;

            if exists {
                tracing::debug!("{} already recorded as {}, skipping create", role, record.id);
                return self.finish(step, &record, shared).await;
            }

            tracing::warn!(
                "{} ({}) no longer exists at the provider, recreating",
                role,
                record.id
            );
            let mut guard = shared.lock().await;
            guard.remove(role);
            self.store.save_descriptor(&guard).await?;
            replaced = Some(record.id);
        }

        if self.cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let (cluster, client_token, dependencies) =
            self.context_for(step, replaced.as_deref(), shared).await?;
        let ctx = ResourceContext {
            cluster: &cluster,
            role,
            client_token: &client_token,
            dependencies: &dependencies,
        };

        let created = retry_with_backoff(&self.retry, &format!("create {}", role), || {
            self.provider.create_resource(&ctx, &step.spec)
        })
        .await?;

        let record = {
            let mut record = ResourceRecord::new(created.id.clone(), role.kind())
                .with_attributes(created.attributes);
            if !created.managed {
                tracing::info!("Adopting existing {} {}", role, created.id);
                record = record.unmanaged();
            }

            let mut guard = shared.lock().await;
            guard.record(role, record);
            self.store.save_descriptor(&guard).await?;
            guard.get(role).cloned().ok_or_else(|| {
                CloudError::StateError(format!("{} vanished from the descriptor", role))
            })?
        };
        tracing::info!("Created {} {}", role, record.id);

        self.finish(step, &record, shared).await
    }

    /// Configure a network resource or wait for an instance to run
    async fn finish(
        &self,
        step: &PlanStep,
        record: &ResourceRecord,
        shared: &SharedDescriptor<'_>,
    ) -> Result<()> {
        let role = step.role;

        if role.is_instance() {
            let needs_wait = matches!(
                record.status,
                ResourceStatus::Pending | ResourceStatus::Failed | ResourceStatus::Deleting
            ) || !record.attributes.contains_key("public_ip");
            if needs_wait {
                self.await_running(role, &record.id, shared).await?;
            }
            return Ok(());
        }

        match record.status {
            ResourceStatus::Pending => {}
            // Still there after an interrupted delete, possibly detached
            ResourceStatus::Deleting => {
                tracing::info!("{} {} survived an interrupted delete", role, record.id);
            }
            _ => return Ok(()),
        }

        let (cluster, client_token, dependencies) = self.context_for(step, None, shared).await?;
        let ctx = ResourceContext {
            cluster: &cluster,
            role,
            client_token: &client_token,
            dependencies: &dependencies,
        };

        let configured = retry_with_backoff(&self.retry, &format!("configure {}", role), || {
            self.provider.configure_resource(&ctx, &step.spec, &record.id)
        })
        .await;

        let mut guard = shared.lock().await;
        match configured {
            Ok(attributes) => {
                guard.merge_attributes(role, attributes);
                guard.set_status(role, ResourceStatus::Available);
                self.store.save_descriptor(&guard).await?;
                tracing::debug!("Configured {} {}", role, record.id);
                Ok(())
            }
            Err(e) => Err(provision_error(ActionType::Configure, role, &guard, e)),
        }
    }

    async fn await_running(
        &self,
        role: ResourceRole,
        id: &str,
        shared: &SharedDescriptor<'_>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.instance_timeout;
        tracing::info!("Waiting for {} ({}) to reach running", role, id);

        loop {
            let info = retry_with_backoff(&self.retry, &format!("describe {}", role), || {
                self.provider.describe_instance(id)
            })
            .await?;

            match info {
                Some(info) if info.state == InstanceState::Running => {
                    let mut attributes = Attributes::new();
                    if let Some(ip) = &info.public_ip {
                        attributes.insert("public_ip".into(), serde_json::json!(ip));
                    }
                    if let Some(ip) = &info.private_ip {
                        attributes.insert("private_ip".into(), serde_json::json!(ip));
                    }

                    let mut guard = shared.lock().await;
                    guard.merge_attributes(role, attributes);
                    guard.set_status(role, ResourceStatus::Running);
                    self.store.save_descriptor(&guard).await?;

                    tracing::info!(
                        "{} is running (public {}, private {})",
                        role,
                        info.public_ip.as_deref().unwrap_or("-"),
                        info.private_ip.as_deref().unwrap_or("-")
                    );
                    return Ok(());
                }
                Some(info) if info.state.is_gone() => {
                    self.mark_failed(role, shared).await?;
                    return Err(CloudError::fatal(
                        "wait for running",
                        "InstanceTerminated",
                        format!("{} ({}) terminated before it started running", role, id),
                    ));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                self.mark_failed(role, shared).await?;
                return Err(CloudError::Timeout(format!(
                    "{} ({}) did not reach running within {}s",
                    role,
                    id,
                    self.instance_timeout.as_secs()
                )));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn mark_failed(&self, role: ResourceRole, shared: &SharedDescriptor<'_>) -> Result<()> {
        let mut guard = shared.lock().await;
        guard.set_status(role, ResourceStatus::Failed);
        self.store.save_descriptor(&guard).await
    }

    /// Issue the provider delete for a recorded role
    async fn begin_destroy(&self, role: ResourceRole, shared: &SharedDescriptor<'_>) -> Result<()> {
        let record = {
            let mut guard = shared.lock().await;
            let Some(record) = guard.get(role).cloned() else {
                tracing::debug!("{} not recorded, nothing to delete", role);
                return Ok(());
            };

            if !record.managed {
                tracing::info!("Forgetting adopted {} {} without deleting it", role, record.id);
                guard.remove(role);
                self.store.save_descriptor(&guard).await?;
                return Ok(());
            }

            guard.set_status(role, ResourceStatus::Deleting);
            self.store.save_descriptor(&guard).await?;
            record
        };

        tracing::info!("Deleting {} {}", role, record.id);
        let result = retry_with_backoff(&self.retry, &format!("delete {}", role), || {
            self.provider
                .delete_resource(record.kind, &record.id, &record.attributes)
        })
        .await;
        ignore_not_found(result)
    }

    /// Wait for the delete to settle, then drop the entry
    async fn finish_destroy(&self, role: ResourceRole, shared: &SharedDescriptor<'_>) -> Result<()> {
        let Some(record) = shared.lock().await.get(role).cloned() else {
            return Ok(());
        };

        if role.is_instance() {
            self.await_terminated(role, &record.id).await?;
        }

        let mut guard = shared.lock().await;
        guard.remove(role);
        self.store.save_descriptor(&guard).await?;
        tracing::info!("Deleted {} {}", role, record.id);
        Ok(())
    }

    async fn await_terminated(&self, role: ResourceRole, id: &str) -> Result<()> {
        let deadline = Instant::now() + self.instance_timeout;

        loop {
            let info = retry_with_backoff(&self.retry, &format!("describe {}", role), || {
                self.provider.describe_instance(id)
            })
            .await?;

            match info {
                None => return Ok(()),
                Some(info) if info.state == InstanceState::Terminated => return Ok(()),
                Some(_) => {}
            }

            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(format!(
                    "{} ({}) did not terminate within {}s",
                    role,
                    id,
                    self.instance_timeout.as_secs()
                )));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Cluster name, client token and identifiers of the step's
    /// dependencies
    async fn context_for(
        &self,
        step: &PlanStep,
        replaced: Option<&str>,
        shared: &SharedDescriptor<'_>,
    ) -> Result<(String, String, BTreeMap<ResourceRole, String>)> {
        let guard = shared.lock().await;
        let mut dependencies = BTreeMap::new();
        for dep in &step.depends_on {
            let id = guard.id(*dep).ok_or_else(|| {
                CloudError::StateError(format!(
                    "{} requires {} which is not recorded",
                    step.role, dep
                ))
            })?;
            dependencies.insert(*dep, id.to_string());
        }
        let token = client_token(&guard, step.role, replaced);
        Ok((guard.name.clone(), token, dependencies))
    }
}

/// Derived from the descriptor's creation time, so a resumed create asks
/// for the same resource and a recreated cluster for a new one
fn client_token(
    descriptor: &ResourceDescriptor,
    role: ResourceRole,
    replaced: Option<&str>,
) -> String {
    let seed = format!(
        "{}/{}/{}/{}",
        descriptor.name,
        descriptor.created_at.timestamp_micros(),
        role,
        replaced.unwrap_or("-")
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

fn provision_error(
    action: ActionType,
    role: ResourceRole,
    descriptor: &ResourceDescriptor,
    source: CloudError,
) -> CloudError {
    match source {
        wrapped @ CloudError::Provision { .. } => wrapped,
        source => CloudError::Provision {
            action,
            role,
            recorded: descriptor.recorded_summary(),
            source: Box::new(source),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailureKind, MemoryProvider};
    use crate::plan::build_plan;
    use clusterflow_config::{ClusterConfig, TimeoutConfig};
    use tempfile::TempDir;

    fn config(cpu: i32, gpu: i32) -> ClusterConfig {
        ClusterConfig {
            region: "us-east-1".into(),
            ami_ssm_parameter: "/aws/service/ami".into(),
            allowed_ingress: "0.0.0.0/0".into(),
            key_name: "k8s".into(),
            key_path: "/tmp/k8s".into(),
            vpc_cidr_block: "10.0.0.0/16".into(),
            main_instance_type: "t3.large".into(),
            worker_instance_type: "t3.large".into(),
            gpu_instance_type: "g4dn.xlarge".into(),
            num_gpu_workers: gpu,
            num_cpu_workers: cpu,
            ssh_user: "ubuntu".into(),
            public_key_path: None,
            availability_zone: None,
            spot_max_price: None,
            pod_network_cidr: "10.244.0.0/16".into(),
            max_parallel_bootstraps: 8,
            timeouts: TimeoutConfig::default(),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn driver(provider: Arc<MemoryProvider>) -> (ProvisioningDriver<MemoryProvider>, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let driver = ProvisioningDriver::new(provider, store)
            .with_retry(fast_retry())
            .with_poll_interval(Duration::from_millis(5))
            .with_instance_timeout(Duration::from_millis(200));
        (driver, temp_dir)
    }

    #[tokio::test]
    async fn test_apply_records_every_resource() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(2, 1)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        driver.apply(&plan, &mut descriptor).await.unwrap();

        assert_eq!(descriptor.resources.len(), plan.steps.len());
        for role in plan.roles() {
            let record = descriptor.get(role).unwrap();
            let expected = if role.is_instance() {
                ResourceStatus::Running
            } else {
                ResourceStatus::Available
            };
            assert_eq!(record.status, expected, "{}", role);
        }
        assert!(descriptor.public_ip(ResourceRole::MainInstance).is_some());
        assert!(
            descriptor
                .get(ResourceRole::RouteTable)
                .unwrap()
                .attributes
                .contains_key("association_id")
        );

        // The flushed state matches what the caller holds
        let persisted = driver.store.descriptor("alpha").await.unwrap().unwrap();
        assert_eq!(persisted, descriptor);
    }

    #[tokio::test]
    async fn test_create_resource_twice_makes_no_mutation() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        driver.apply(&plan, &mut descriptor).await.unwrap();
        let before = descriptor.clone();
        let mutations = provider.mutation_count();

        driver
            .create_resource(ResourceRole::SecurityGroup, &plan, &mut descriptor)
            .await
            .unwrap();
        driver
            .create_resource(ResourceRole::MainInstance, &plan, &mut descriptor)
            .await
            .unwrap();

        assert_eq!(provider.mutation_count(), mutations);
        assert_eq!(descriptor.resources, before.resources);
    }

    #[tokio::test]
    async fn test_stale_record_is_recreated() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        driver
            .create_resource(ResourceRole::Vpc, &plan, &mut descriptor)
            .await
            .unwrap();
        let old_id = descriptor.id(ResourceRole::Vpc).unwrap().to_string();
        provider.remove_externally(&old_id);

        driver
            .create_resource(ResourceRole::Vpc, &plan, &mut descriptor)
            .await
            .unwrap();
        let new_id = descriptor.id(ResourceRole::Vpc).unwrap();
        assert_ne!(new_id, old_id);
    }

    #[tokio::test]
    async fn test_lost_create_response_does_not_duplicate() {
        let provider = Arc::new(MemoryProvider::new());
        provider.lose_next_response("create:vpc", 1);
        provider.lose_next_response("create:instance", 1);
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(1, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        driver.apply(&plan, &mut descriptor).await.unwrap();

        let creates = provider
            .mutations()
            .iter()
            .filter(|m| m.starts_with("create:"))
            .count();
        assert_eq!(creates, plan.steps.len());
        assert_eq!(provider.live_ids().len(), descriptor.resources.len());
    }

    #[test]
    fn test_client_token() {
        let descriptor = ResourceDescriptor::new("alpha", "us-east-1");
        let token = client_token(&descriptor, ResourceRole::Vpc, None);

        assert_eq!(token, client_token(&descriptor.clone(), ResourceRole::Vpc, None));
        assert!(token.len() <= 64);
        assert_ne!(token, client_token(&descriptor, ResourceRole::Subnet, None));
        assert_ne!(token, client_token(&descriptor, ResourceRole::Vpc, Some("vpc-1")));

        let mut recreated = descriptor.clone();
        recreated.created_at += chrono::Duration::seconds(1);
        assert_ne!(token, client_token(&recreated, ResourceRole::Vpc, None));
    }

    #[tokio::test]
    async fn test_interrupted_delete_is_undone_by_apply() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");
        driver.apply(&plan, &mut descriptor).await.unwrap();

        let rtb = descriptor.id(ResourceRole::RouteTable).unwrap().to_string();
        for role in [ResourceRole::RouteTable, ResourceRole::InternetGateway] {
            descriptor.set_status(role, ResourceStatus::Deleting);
        }
        let mutations = provider.mutation_count();

        driver.apply(&plan, &mut descriptor).await.unwrap();

        for role in [ResourceRole::RouteTable, ResourceRole::InternetGateway] {
            assert_eq!(descriptor.get(role).unwrap().status, ResourceStatus::Available);
        }
        assert_eq!(descriptor.id(ResourceRole::RouteTable), Some(rtb.as_str()));
        let redone: Vec<String> = provider.mutations()[mutations..].to_vec();
        assert_eq!(redone.len(), 2);
        assert!(redone.iter().all(|m| m.starts_with("configure:")));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_next("create:subnet", FailureKind::Transient, 2);
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        driver.apply(&plan, &mut descriptor).await.unwrap();
        assert!(descriptor.get(ResourceRole::Subnet).is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_halts_and_keeps_records() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_next("create:security_group", FailureKind::Fatal, 1);
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(2, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        let err = driver.apply(&plan, &mut descriptor).await.unwrap_err();
        match &err {
            CloudError::Provision { role, recorded, .. } => {
                assert_eq!(*role, ResourceRole::SecurityGroup);
                assert!(recorded.iter().any(|r| r.starts_with("vpc=")));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(err.root(), CloudError::Fatal { .. }));

        // Everything created before the failure is still recorded
        assert!(descriptor.get(ResourceRole::Vpc).is_some());
        assert!(descriptor.get(ResourceRole::RouteTable).is_some());
        assert!(descriptor.get(ResourceRole::SecurityGroup).is_none());
        assert!(descriptor.instance_roles().is_empty());
    }

    #[tokio::test]
    async fn test_instance_failure_stops_further_launches() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_next("create:instance", FailureKind::Fatal, 1);
        let (driver, _dir) = driver(provider.clone());
        let driver = driver.with_max_concurrent_launches(1);
        let plan = build_plan(&config(3, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        let err = driver.apply(&plan, &mut descriptor).await.unwrap_err();
        assert!(matches!(err.root(), CloudError::Fatal { .. }));
        assert!(descriptor.instance_roles().is_empty());
    }

    #[tokio::test]
    async fn test_instance_running_timeout_marks_failed() {
        let provider = Arc::new(MemoryProvider::new());
        provider.hold_instances_pending(true);
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        let err = driver.apply(&plan, &mut descriptor).await.unwrap_err();
        assert!(matches!(err.root(), CloudError::Timeout(_)));
        assert_eq!(
            descriptor.get(ResourceRole::MainInstance).unwrap().status,
            ResourceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancelled_apply_creates_nothing() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let driver = driver.with_cancellation(cancel);
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        let err = driver.apply(&plan, &mut descriptor).await.unwrap_err();
        assert!(matches!(err.root(), CloudError::Cancelled));
        assert_eq!(provider.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_absent_role_succeeds() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");

        driver
            .destroy_resource(ResourceRole::GpuInstance(3), &mut descriptor)
            .await
            .unwrap();
        assert_eq!(provider.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_all_in_reverse_order() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(1, 1)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");
        driver.apply(&plan, &mut descriptor).await.unwrap();

        driver.destroy_all(&mut descriptor).await.unwrap();

        assert!(!descriptor.is_live());
        assert!(provider.live_ids().is_empty());

        let deleted: Vec<String> = provider
            .mutations()
            .into_iter()
            .filter(|m| m.starts_with("delete:") && !m.starts_with("delete:instance"))
            .collect();
        let kinds: Vec<&str> = deleted
            .iter()
            .map(|m| m.split(':').nth(1).unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "key_pair",
                "security_group",
                "route_table",
                "internet_gateway",
                "subnet",
                "vpc"
            ]
        );

        // Re-running a finished delete is a no-op
        driver.destroy_all(&mut descriptor).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_tolerates_already_gone() {
        let provider = Arc::new(MemoryProvider::new());
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");
        driver.apply(&plan, &mut descriptor).await.unwrap();

        let sg = descriptor.id(ResourceRole::SecurityGroup).unwrap().to_string();
        provider.remove_externally(&sg);

        driver.destroy_all(&mut descriptor).await.unwrap();
        assert!(!descriptor.is_live());
    }

    #[tokio::test]
    async fn test_adopted_key_pair_is_not_deleted() {
        let provider = Arc::new(MemoryProvider::new().with_existing_key_pair("k8s"));
        let (driver, _dir) = driver(provider.clone());
        let plan = build_plan(&config(0, 0)).unwrap();
        let mut descriptor = ResourceDescriptor::new("alpha", "us-east-1");
        driver.apply(&plan, &mut descriptor).await.unwrap();

        assert!(!descriptor.get(ResourceRole::KeyPair).unwrap().managed);

        driver.destroy_all(&mut descriptor).await.unwrap();
        assert!(
            !provider
                .mutations()
                .iter()
                .any(|m| m.starts_with("delete:key_pair"))
        );
        assert_eq!(provider.live_ids().len(), 1);
    }
}
