use clusterflow_bootstrap::scripted::ScriptedExecutor;
use clusterflow_bootstrap::BootstrapState;
use clusterflow_cloud::memory::{FailureKind, MemoryProvider};
use clusterflow_cloud::{LockOperation, ResourceRole, ResourceStatus, StateStore};
use clusterflow_config::ClusterConfig;
use clusterflow_registry::{
    ClusterRegistry, ClusterStatus, CreateOptions, ErrorKind, RegistryError, StaticBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type TestRegistry = ClusterRegistry<StaticBackend<MemoryProvider, ScriptedExecutor>>;

struct Harness {
    dir: TempDir,
    provider: Arc<MemoryProvider>,
    executor: Arc<ScriptedExecutor>,
    registry: TestRegistry,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let registry = ClusterRegistry::new(
        StaticBackend::new(provider.clone(), executor.clone()),
        StateStore::new(dir.path()),
    )
    .with_poll_interval(Duration::from_millis(500));

    Harness {
        dir,
        provider,
        executor,
        registry,
    }
}

impl Harness {
    /// A registry sharing the state directory, as a second CLI process would
    fn other_process(&self) -> TestRegistry {
        ClusterRegistry::new(
            StaticBackend::new(self.provider.clone(), self.executor.clone()),
            StateStore::new(self.dir.path()),
        )
        .with_poll_interval(Duration::from_millis(500))
    }
}

fn config(cpu_workers: i32, gpu_workers: i32) -> ClusterConfig {
    serde_json::from_value(serde_json::json!({
        "region": "us-east-1",
        "ami_ssm_parameter": "/aws/service/canonical/ubuntu/server/22.04/stable/current/amd64/hvm/ebs-gp2/ami-id",
        "allowed_ingress": "203.0.113.0/24",
        "key_name": "demo-key",
        "key_path": "/tmp/demo-key.pem",
        "vpc_cidr_block": "10.0.0.0/16",
        "main_instance_type": "t3.large",
        "worker_instance_type": "t3.large",
        "gpu_instance_type": "g4dn.xlarge",
        "num_cpu_workers": cpu_workers,
        "num_gpu_workers": gpu_workers,
        "timeouts": {
            "instance_running_secs": 30,
            "ssh_secs": 10,
            "ssh_retry_interval_secs": 1,
            "control_plane_secs": 20,
            "join_credential_secs": 10,
            "worker_ready_secs": 20,
            "join_secs": 10
        }
    }))
    .unwrap()
}

fn created_count(provider: &MemoryProvider) -> usize {
    provider
        .mutations()
        .iter()
        .filter(|m| m.starts_with("create:"))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_create_with_two_workers() {
    let h = harness();

    let report = h
        .registry
        .create("demo", &config(2, 0), CreateOptions::default())
        .await
        .unwrap();

    let descriptor = h.registry.store().descriptor("demo").await.unwrap().unwrap();
    let instances = descriptor.instance_roles();
    assert_eq!(
        instances,
        vec![
            ResourceRole::MainInstance,
            ResourceRole::WorkerInstance(0),
            ResourceRole::WorkerInstance(1),
        ]
    );
    assert_eq!(
        descriptor.get(ResourceRole::MainInstance).unwrap().status,
        ResourceStatus::Ready
    );
    for i in 0..2 {
        assert_eq!(
            descriptor.get(ResourceRole::WorkerInstance(i)).unwrap().status,
            ResourceStatus::Joined
        );
    }
    assert_eq!(report.nodes.len(), 3);

    let path = h.registry.kubeconfig("demo").await.unwrap();
    assert!(!path.as_os_str().is_empty());
    assert_eq!(path, report.kubeconfig_path);
    let main_ip = descriptor.public_ip(ResourceRole::MainInstance).unwrap();
    let kubeconfig = std::fs::read_to_string(&path).unwrap();
    assert!(kubeconfig.contains(&format!("https://{}:6443", main_ip)));

    let clusters = h.registry.list().await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].name, "demo");
    assert_eq!(clusters[0].status, ClusterStatus::Ready);
    assert_eq!(clusters[0].main_ip.as_deref(), Some(main_ip.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_workers_join_only_after_main_ready() {
    let h = harness();

    let report = h
        .registry
        .create("demo", &config(2, 1), CreateOptions::default())
        .await
        .unwrap();

    let ready_at = report
        .trace
        .iter()
        .position(|e| e.node == "main_instance" && e.to == BootstrapState::Ready)
        .unwrap();
    let joined: Vec<usize> = report
        .trace
        .iter()
        .enumerate()
        .filter(|(_, e)| e.to == BootstrapState::Joined)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(joined.len(), 3);
    assert!(joined.iter().all(|&i| i > ready_at));
    assert_eq!(h.executor.joined_hosts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_create_existing_name_fails_without_provider_calls() {
    let h = harness();
    h.registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap();
    let before = h.provider.mutation_count();

    let err = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::AlreadyExists(_)));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(h.provider.mutation_count(), before);
}

#[tokio::test(start_paused = true)]
async fn test_delete_after_create_empties_everything() {
    let h = harness();
    h.registry
        .create("demo", &config(2, 0), CreateOptions::default())
        .await
        .unwrap();
    let kubeconfig = h.registry.kubeconfig("demo").await.unwrap();

    let report = h.registry.delete("demo").await.unwrap();

    assert_eq!(report.removed.len(), 9);
    assert!(h.registry.list().await.unwrap().is_empty());
    assert!(h.registry.store().descriptor("demo").await.unwrap().is_none());
    assert!(h.provider.live_ids().is_empty());
    assert!(!kubeconfig.exists());
    assert!(matches!(
        h.registry.kubeconfig("demo").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_cluster_is_not_found() {
    let h = harness();

    let err = h.registry.delete("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.registry.kubeconfig("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.provider.mutation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_makes_no_calls() {
    let h = harness();

    let err = h
        .registry
        .create("demo", &config(-1, 0), CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigError);
    assert_eq!(h.provider.mutation_count(), 0);
    assert!(h.registry.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_main_bootstrap_timeout_keeps_descriptor() {
    let h = harness();
    h.executor.stall_all_payloads(true);

    let err = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BootstrapTimeout);
    assert!(err.to_string().contains("main_instance"));

    let descriptor = h.registry.store().descriptor("demo").await.unwrap().unwrap();
    assert_eq!(
        descriptor.get(ResourceRole::MainInstance).unwrap().status,
        ResourceStatus::Failed
    );
    assert!(descriptor.get(ResourceRole::Vpc).is_some());
    assert!(descriptor.get(ResourceRole::WorkerInstance(0)).is_some());
    assert!(descriptor.kubeconfig_path.is_none());

    h.registry.delete("demo").await.unwrap();
    assert!(h.provider.live_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_finishes_without_recreating() {
    let h = harness();
    h.executor.crash_all_payloads(true);
    let err = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BootstrapTimeout);
    let created = created_count(&h.provider);

    h.executor.crash_all_payloads(false);
    let err = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyExists(_)));

    h.registry
        .create("demo", &config(1, 0), CreateOptions { resume: true })
        .await
        .unwrap();

    assert_eq!(created_count(&h.provider), created);
    let descriptor = h.registry.store().descriptor("demo").await.unwrap().unwrap();
    let main_ip = descriptor.public_ip(ResourceRole::MainInstance).unwrap();
    assert_eq!(h.executor.payload_uploads(&main_ip), 2);
    let clusters = h.registry.list().await.unwrap();
    assert_eq!(clusters[0].status, ClusterStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_resume_waits_for_payload_still_running() {
    let h = harness();
    h.executor.stall_all_payloads(true);
    h.registry
        .create("demo", &config(0, 0), CreateOptions::default())
        .await
        .unwrap_err();
    let main_ip = h
        .registry
        .store()
        .descriptor("demo")
        .await
        .unwrap()
        .unwrap()
        .public_ip(ResourceRole::MainInstance)
        .unwrap();

    let resume = h
        .registry
        .create("demo", &config(0, 0), CreateOptions { resume: true });
    let finish = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.executor
            .with_file(&main_ip, clusterflow_bootstrap::payload::MAIN_SIGNAL);
    };
    let (resumed, ()) = tokio::join!(resume, finish);

    resumed.unwrap();
    assert_eq!(h.executor.payload_uploads(&main_ip), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_worker_reports_partial_create() {
    let h = harness();
    h.executor.fail_next_joins(1);

    let err = h
        .registry
        .create("demo", &config(2, 0), CreateOptions::default())
        .await
        .unwrap_err();

    match &err {
        RegistryError::PartialCreateFailure { joined, failed, .. } => {
            assert_eq!(failed.len(), 1);
            assert_eq!(joined.len(), 2);
            assert!(joined.contains(&"main_instance".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 11);

    let descriptor = h.registry.store().descriptor("demo").await.unwrap().unwrap();
    assert_eq!(descriptor.instance_roles().len(), 3);
    let failed = descriptor
        .resources
        .values()
        .filter(|r| r.status == ResourceStatus::Failed)
        .count();
    assert_eq!(failed, 1);
    assert!(h.registry.kubeconfig("demo").await.is_ok());

    let clusters = h.registry.list().await.unwrap();
    assert_eq!(clusters[0].status, ClusterStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_provider_error_keeps_created_resources() {
    let h = harness();
    h.provider
        .fail_next("create:security_group", FailureKind::Fatal, 1);

    let err = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FatalProviderError);
    assert!(err.to_string().contains("security_group"));

    let descriptor = h.registry.store().descriptor("demo").await.unwrap().unwrap();
    assert!(descriptor.get(ResourceRole::Vpc).is_some());
    assert!(descriptor.get(ResourceRole::SecurityGroup).is_none());
    assert!(descriptor.instance_roles().is_empty());

    h.registry.delete("demo").await.unwrap();
    assert!(h.provider.live_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_provider_is_reported_as_such() {
    let h = harness();
    h.provider
        .fail_next("create:vpc", FailureKind::Unreachable, 1);

    let err = h
        .registry
        .create("demo", &config(0, 0), CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProviderUnreachable);
}

#[tokio::test(start_paused = true)]
async fn test_delete_cancels_in_flight_create() {
    let h = harness();
    h.provider.hold_instances_pending(true);

    let create = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default());
    let delete = async {
        loop {
            let launched = h
                .registry
                .store()
                .descriptor("demo")
                .await
                .unwrap()
                .is_some_and(|d| d.get(ResourceRole::MainInstance).is_some());
            if launched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        h.registry.delete("demo").await
    };

    let (created, deleted) = tokio::join!(create, delete);

    assert_eq!(created.unwrap_err().kind(), ErrorKind::Cancelled);
    deleted.unwrap();
    assert!(h.registry.list().await.unwrap().is_empty());
    assert!(h.provider.live_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_create_of_same_name_is_busy() {
    let h = harness();
    h.executor.stall_all_payloads(true);

    let first = h
        .registry
        .create("demo", &config(0, 0), CreateOptions::default());
    let second = async {
        let main_ip = loop {
            let descriptor = h.registry.store().descriptor("demo").await.unwrap();
            let bootstrapping = descriptor.as_ref().and_then(|d| {
                let record = d.get(ResourceRole::MainInstance)?;
                (record.status == ResourceStatus::Bootstrapping)
                    .then(|| d.public_ip(ResourceRole::MainInstance))
                    .flatten()
            });
            if let Some(ip) = bootstrapping {
                break ip;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        let result = h
            .registry
            .create("demo", &config(0, 0), CreateOptions::default())
            .await;

        // let the first create finish
        h.executor
            .with_file(&main_ip, clusterflow_bootstrap::payload::MAIN_SIGNAL);
        result
    };

    let (first, second) = tokio::join!(first, second);

    assert_eq!(second.unwrap_err().kind(), ErrorKind::Busy);
    assert!(first.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_delete_from_other_process_cancels_create() {
    let h = harness();
    h.provider.hold_instances_pending(true);
    let other = h.other_process();

    let create = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default());
    let delete = async {
        loop {
            let launched = other
                .store()
                .descriptor("demo")
                .await
                .unwrap()
                .is_some_and(|d| d.get(ResourceRole::MainInstance).is_some());
            if launched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        other.delete("demo").await
    };

    let (created, deleted) = tokio::join!(create, delete);

    assert_eq!(created.unwrap_err().kind(), ErrorKind::Cancelled);
    deleted.unwrap();
    assert!(other.list().await.unwrap().is_empty());
    assert!(h.provider.live_ids().is_empty());
    assert!(other.store().lock_holder("demo").await.unwrap().is_none());
    assert!(!other.store().cancel_requested("demo").await);
}

#[tokio::test(start_paused = true)]
async fn test_other_process_delete_lock_makes_us_busy() {
    let h = harness();
    let lock = StateStore::new(h.dir.path())
        .acquire_lock("demo", LockOperation::Delete)
        .await
        .unwrap();

    let err = h
        .registry
        .create("demo", &config(1, 0), CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    let err = h.registry.delete("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(h.provider.mutation_count(), 0);

    lock.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_delete_gives_up_on_create_that_does_not_stop() {
    let h = harness();
    let registry = h.other_process().with_preempt_timeout(Duration::from_secs(10));
    let lock = StateStore::new(h.dir.path())
        .acquire_lock("demo", LockOperation::Create)
        .await
        .unwrap();

    let err = registry.delete("demo").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(!registry.store().cancel_requested("demo").await);
    lock.release().await.unwrap();
}
