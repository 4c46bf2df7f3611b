//! State management for cluster resources
//!
//! Manages `<state_dir>/state.json`, which maps every cluster name to the
//! descriptor of the cloud resources created for it. The file is rewritten
//! after every resource operation and is never left half-written.

use crate::error::{CloudError, Result};
use crate::plan::{ResourceKind, ResourceRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const STATE_TEMP: &str = "state.json.tmp";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_DIR: &str = "locks";
const LOCK_ATTEMPTS: usize = 3;
const LOCK_MAX_AGE_HOURS: i64 = 1;
const LOCK_WRITE_GRACE: Duration = Duration::from_secs(10);
const KUBECONFIG_DIR: &str = "kubeconfig";

/// Free-form resource attributes (IPs, association ids, ...)
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Global state containing every cluster descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Descriptors indexed by cluster name
    pub clusters: BTreeMap<String, ResourceDescriptor>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            clusters: BTreeMap::new(),
        }
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Every resource recorded for one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,

    pub region: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Admin kubeconfig captured when the main node became ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_path: Option<PathBuf>,

    /// Recorded resources by role
    #[serde(default)]
    pub resources: BTreeMap<ResourceRole, ResourceRecord>,

    /// Sequence number handed to the next recorded resource
    #[serde(default)]
    pub next_sequence: u64,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            region: region.into(),
            created_at: now,
            updated_at: now,
            kubeconfig_path: None,
            resources: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// A descriptor is live while it still records any resource
    pub fn is_live(&self) -> bool {
        !self.resources.is_empty()
    }

    pub fn get(&self, role: ResourceRole) -> Option<&ResourceRecord> {
        self.resources.get(&role)
    }

    pub fn id(&self, role: ResourceRole) -> Option<&str> {
        self.resources.get(&role).map(|r| r.id.as_str())
    }

    /// Record a resource the provider confirmed
    pub fn record(&mut self, role: ResourceRole, record: ResourceRecord) {
        let mut record = record;
        record.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.resources.insert(role, record);
        self.touch();
    }

    pub fn remove(&mut self, role: ResourceRole) -> Option<ResourceRecord> {
        let removed = self.resources.remove(&role);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn set_status(&mut self, role: ResourceRole, status: ResourceStatus) {
        if let Some(record) = self.resources.get_mut(&role) {
            record.status = status;
            record.updated_at = Utc::now();
            self.touch();
        }
    }

    pub fn merge_attributes(&mut self, role: ResourceRole, attributes: Attributes) {
        if let Some(record) = self.resources.get_mut(&role) {
            record.attributes.extend(attributes);
            record.updated_at = Utc::now();
            self.touch();
        }
    }

    /// Recorded roles, latest created first
    pub fn teardown_order(&self) -> Vec<ResourceRole> {
        let mut roles: Vec<(u64, ResourceRole)> = self
            .resources
            .iter()
            .map(|(role, record)| (record.sequence, *role))
            .collect();
        roles.sort_by(|a, b| b.0.cmp(&a.0));
        roles.into_iter().map(|(_, role)| role).collect()
    }

    pub fn instance_roles(&self) -> Vec<ResourceRole> {
        self.resources
            .keys()
            .filter(|role| role.is_instance())
            .copied()
            .collect()
    }

    /// `role=status` for every recorded resource, for error reports
    pub fn recorded_summary(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|(role, record)| format!("{}={}", role, record.status))
            .collect()
    }

    pub fn public_ip(&self, role: ResourceRole) -> Option<String> {
        self.get(role)?.get_attribute("public_ip")
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// State of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Provider-specific resource ID
    pub id: String,

    pub kind: ResourceKind,

    /// Current status
    pub status: ResourceStatus,

    /// Resource attributes (IP, association id, etc.)
    #[serde(default)]
    pub attributes: Attributes,

    /// False when the resource existed before this cluster and was adopted.
    /// Teardown forgets it without deleting it.
    #[serde(default = "default_managed")]
    pub managed: bool,

    /// Creation order within the cluster
    #[serde(default)]
    pub sequence: u64,

    /// When the resource was created
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

fn default_managed() -> bool {
    true
}

impl ResourceRecord {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: ResourceStatus::Pending,
            attributes: Attributes::new(),
            managed: true,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Created at the provider, not yet configured or running
    Pending,
    /// Network resource fully configured
    Available,
    /// Instance is running
    Running,
    /// Node payload is being applied
    Bootstrapping,
    /// Control plane initialized
    Ready,
    /// Worker joined the cluster
    Joined,
    /// Node failed to bootstrap or join
    Failed,
    /// Resource is being deleted
    Deleting,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Available => write!(f, "available"),
            ResourceStatus::Running => write!(f, "running"),
            ResourceStatus::Bootstrapping => write!(f, "bootstrapping"),
            ResourceStatus::Ready => write!(f, "ready"),
            ResourceStatus::Joined => write!(f, "joined"),
            ResourceStatus::Failed => write!(f, "failed"),
            ResourceStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// Reader/writer for the state file
///
/// Cheap to clone. Writes are serialized and performed as
/// read-modify-write of the single descriptor being changed, so concurrent
/// operations on different clusters never drop each other's updates.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state_dir: state_dir.as_ref().to_path_buf(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    /// Get the state file path
    pub fn state_path(&self) -> PathBuf {
        self.inner.state_dir.join(STATE_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.inner.state_dir.join(STATE_TEMP)
    }

    fn backup_path(&self) -> PathBuf {
        self.inner.state_dir.join(STATE_BACKUP)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.inner
            .state_dir
            .join(LOCK_DIR)
            .join(format!("{}.lock", name))
    }

    fn cancel_path(&self, name: &str) -> PathBuf {
        self.inner
            .state_dir
            .join(LOCK_DIR)
            .join(format!("{}.cancel", name))
    }

    /// Where the kubeconfig of a cluster is stored
    pub fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.inner
            .state_dir
            .join(KUBECONFIG_DIR)
            .join(format!("{}.yaml", name))
    }

    /// Ensure the state directory exists
    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<GlobalState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(GlobalState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: GlobalState = serde_json::from_str(&content).map_err(|e| {
            CloudError::StateError(format!("{} is not valid: {}", path.display(), e))
        })?;

        // Version check
        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} clusters", state.clusters.len());
        Ok(state)
    }

    /// Save the whole state: write a temp file, keep the previous file as
    /// backup, then rename into place.
    pub async fn save(&self, state: &GlobalState) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let temp = self.temp_path();

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&temp, content).await?;

        if path.exists() {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!("Saved state with {} clusters", state.clusters.len());
        Ok(())
    }

    pub async fn descriptor(&self, name: &str) -> Result<Option<ResourceDescriptor>> {
        Ok(self.load().await?.clusters.remove(name))
    }

    pub async fn list(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(self.load().await?.clusters.into_values().collect())
    }

    /// Flush one descriptor
    pub async fn save_descriptor(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;

        let mut state = self.load().await?;
        state
            .clusters
            .insert(descriptor.name.clone(), descriptor.clone());
        state.updated_at = Utc::now();
        self.save(&state).await
    }

    pub async fn remove_descriptor(&self, name: &str) -> Result<Option<ResourceDescriptor>> {
        let _guard = self.inner.write_lock.lock().await;

        let mut state = self.load().await?;
        let removed = state.clusters.remove(name);
        if removed.is_some() {
            state.updated_at = Utc::now();
            self.save(&state).await?;
        }
        Ok(removed)
    }

    /// Acquire the cross-process lock of one cluster.
    ///
    /// The lock file is created exclusively. An existing lock is taken over
    /// only when it is stale: an hour old, or held by a process on this
    /// host that no longer exists.
    pub async fn acquire_lock(&self, name: &str, operation: LockOperation) -> Result<ClusterLock> {
        let lock_path = self.lock_path(name);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let holder = LockHolder::current(operation);
        let content = serde_json::to_string_pretty(&holder)?;

        for _ in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await?;
                    file.sync_all().await?;
                    tracing::debug!("Acquired {} lock for cluster {}", operation, name);
                    return Ok(ClusterLock {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.clear_stale_lock(name, &lock_path).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CloudError::LockError(format!("Cluster '{}' lock is contended", name)))
    }

    /// Remove the lock at `lock_path` if it is stale, fail if it is held
    async fn clear_stale_lock(&self, name: &str, lock_path: &Path) -> Result<()> {
        let content = match fs::read_to_string(lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<LockHolder>(&content) {
            Ok(holder) if !holder.is_stale() => {
                return Err(CloudError::LockError(format!(
                    "Cluster '{}' is locked for {} by {} (pid {}) since {}",
                    name, holder.operation, holder.host, holder.pid, holder.acquired_at
                )));
            }
            Ok(holder) => {
                tracing::warn!(
                    "Removing stale {} lock of {} held by {} (pid {})",
                    holder.operation,
                    name,
                    holder.host,
                    holder.pid
                );
            }
            Err(e) => {
                // The holder may still be writing it
                let modified = fs::metadata(lock_path).await?.modified()?;
                if modified.elapsed().unwrap_or_default() < LOCK_WRITE_GRACE {
                    return Err(CloudError::LockError(format!(
                        "Cluster '{}' lock is being acquired",
                        name
                    )));
                }
                tracing::warn!("Replacing unreadable lock file of {}: {}", name, e);
            }
        }

        // Only remove what was judged stale, not a lock taken in between
        if fs::read_to_string(lock_path).await.ok().as_deref() == Some(content.as_str()) {
            match fs::remove_file(lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Who holds the lock of a cluster, if anybody
    pub async fn lock_holder(&self, name: &str) -> Result<Option<LockHolder>> {
        match fs::read_to_string(self.lock_path(name)).await {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the process creating a cluster to stop. It polls
    /// [`StateStore::cancel_requested`] and releases its lock once cancelled.
    pub async fn request_cancel(&self, name: &str) -> Result<()> {
        let path = self.cancel_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let requester = LockHolder::current(LockOperation::Delete);
        fs::write(&path, serde_json::to_string_pretty(&requester)?).await?;
        tracing::debug!("Requested cancellation of {}", name);
        Ok(())
    }

    /// True while a live delete asks for the create of `name` to stop.
    /// Requests left behind by a delete that died are ignored.
    pub async fn cancel_requested(&self, name: &str) -> bool {
        match fs::read_to_string(self.cancel_path(name)).await {
            Ok(content) => serde_json::from_str::<LockHolder>(&content)
                .is_ok_and(|requester| !requester.is_stale()),
            Err(_) => false,
        }
    }

    pub async fn clear_cancel_request(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.cancel_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What the holder of a cluster lock is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOperation {
    Create,
    Delete,
}

impl std::fmt::Display for LockOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOperation::Create => write!(f, "create"),
            LockOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub host: String,
    pub pid: u32,
    pub operation: LockOperation,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current(operation: LockOperation) -> Self {
        Self {
            host: local_host(),
            pid: std::process::id(),
            operation,
            acquired_at: Utc::now(),
        }
    }

    /// Locks expire after an hour. A holder on this host whose process is
    /// gone is stale right away; other hosts' processes cannot be checked.
    pub fn is_stale(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        if age >= chrono::Duration::hours(LOCK_MAX_AGE_HOURS) {
            return true;
        }
        self.host == local_host() && !process_alive(self.pid)
    }
}

fn local_host() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// RAII guard for a cluster lock
pub struct ClusterLock {
    lock_path: PathBuf,
    released: bool,
}

impl ClusterLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => tracing::debug!("Released lock {}", self.lock_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_descriptor(name: &str) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(name, "us-east-1");
        descriptor.record(
            ResourceRole::Vpc,
            ResourceRecord::new("vpc-0001", ResourceKind::Vpc)
                .with_status(ResourceStatus::Available),
        );
        descriptor.record(
            ResourceRole::MainInstance,
            ResourceRecord::new("i-0001", ResourceKind::Instance)
                .with_status(ResourceStatus::Ready)
                .with_attributes(Attributes::from([(
                    "public_ip".to_string(),
                    serde_json::json!("198.51.100.7"),
                )])),
        );
        descriptor.record(
            ResourceRole::WorkerInstance(0),
            ResourceRecord::new("i-0002", ResourceKind::Instance)
                .with_status(ResourceStatus::Joined),
        );
        descriptor
    }

    #[tokio::test]
    async fn test_descriptor_save_load() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        let descriptor = sample_descriptor("alpha");
        store.save_descriptor(&descriptor).await.unwrap();

        let loaded = store.descriptor("alpha").await.unwrap().unwrap();
        assert_eq!(loaded, descriptor);
        assert_eq!(
            loaded.public_ip(ResourceRole::MainInstance).as_deref(),
            Some("198.51.100.7")
        );
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        let state = store.load().await.unwrap();
        assert!(state.clusters.is_empty());
        assert!(store.descriptor("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roles_serialize_as_keys() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        store
            .save_descriptor(&sample_descriptor("alpha"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.state_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let resources = &value["clusters"]["alpha"]["resources"];
        assert_eq!(resources["worker_instance[0]"]["id"], "i-0002");
        assert_eq!(resources["main_instance"]["status"], "ready");
    }

    #[tokio::test]
    async fn test_backup_kept_and_clusters_independent() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        store
            .save_descriptor(&sample_descriptor("alpha"))
            .await
            .unwrap();
        store
            .save_descriptor(&sample_descriptor("beta"))
            .await
            .unwrap();

        assert!(temp_dir.path().join(STATE_BACKUP).exists());
        assert!(!temp_dir.path().join(STATE_TEMP).exists());

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

        store.remove_descriptor("alpha").await.unwrap();
        assert!(store.descriptor("alpha").await.unwrap().is_none());
        assert!(store.descriptor("beta").await.unwrap().is_some());
    }

    #[test]
    fn test_teardown_order_is_reverse_sequence() {
        let descriptor = sample_descriptor("alpha");
        assert_eq!(
            descriptor.teardown_order(),
            vec![
                ResourceRole::WorkerInstance(0),
                ResourceRole::MainInstance,
                ResourceRole::Vpc,
            ]
        );
    }

    #[tokio::test]
    async fn test_cluster_lock() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        let lock = store.acquire_lock("alpha", LockOperation::Create).await.unwrap();
        assert!(matches!(
            store.acquire_lock("alpha", LockOperation::Delete).await,
            Err(CloudError::LockError(_))
        ));
        let holder = store.lock_holder("alpha").await.unwrap().unwrap();
        assert_eq!(holder.operation, LockOperation::Create);
        assert_eq!(holder.pid, std::process::id());

        // Locks are per cluster
        let other = store.acquire_lock("beta", LockOperation::Create).await.unwrap();

        lock.release().await.unwrap();
        assert!(store.lock_holder("alpha").await.unwrap().is_none());
        let again = store.acquire_lock("alpha", LockOperation::Delete).await.unwrap();
        drop(again);
        drop(other);
        assert!(store.acquire_lock("beta", LockOperation::Create).await.is_ok());
    }

    fn write_lock(store: &StateStore, name: &str, holder: &LockHolder) {
        let path = store.lock_path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(holder).unwrap()).unwrap();
    }

    fn holder(host: String, pid: u32, age: chrono::Duration) -> LockHolder {
        LockHolder {
            host,
            pid,
            operation: LockOperation::Create,
            acquired_at: Utc::now() - age,
        }
    }

    // Far above any pid_max
    const DEAD_PID: u32 = 999_999_999;

    #[tokio::test]
    async fn test_lock_older_than_an_hour_is_replaced() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let old = holder(local_host(), std::process::id(), chrono::Duration::minutes(61));
        write_lock(&store, "alpha", &old);

        let lock = store.acquire_lock("alpha", LockOperation::Delete).await.unwrap();

        let current = store.lock_holder("alpha").await.unwrap().unwrap();
        assert_eq!(current.operation, LockOperation::Delete);
        assert!(current.acquired_at > old.acquired_at);
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_young_lock_of_live_process_is_busy() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let young = holder(local_host(), std::process::id(), chrono::Duration::minutes(59));
        write_lock(&store, "alpha", &young);

        let result = store.acquire_lock("alpha", LockOperation::Delete).await;

        assert!(matches!(result, Err(CloudError::LockError(ref m)) if m.contains("create")));
        assert_eq!(store.lock_holder("alpha").await.unwrap(), Some(young));
    }

    #[tokio::test]
    async fn test_lock_of_dead_process_is_replaced() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        write_lock(
            &store,
            "alpha",
            &holder(local_host(), DEAD_PID, chrono::Duration::minutes(1)),
        );

        let lock = store.acquire_lock("alpha", LockOperation::Create).await;

        assert!(lock.is_ok());
        let current = store.lock_holder("alpha").await.unwrap().unwrap();
        assert_eq!(current.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_young_lock_from_other_host_is_busy() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let remote = holder(
            format!("{}-elsewhere", local_host()),
            DEAD_PID,
            chrono::Duration::minutes(1),
        );
        write_lock(&store, "alpha", &remote);

        assert!(matches!(
            store.acquire_lock("alpha", LockOperation::Create).await,
            Err(CloudError::LockError(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        assert!(!store.cancel_requested("alpha").await);

        store.request_cancel("alpha").await.unwrap();
        assert!(store.cancel_requested("alpha").await);
        assert!(!store.cancel_requested("beta").await);

        store.clear_cancel_request("alpha").await.unwrap();
        assert!(!store.cancel_requested("alpha").await);
        // Clearing twice is fine
        store.clear_cancel_request("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_request_of_dead_requester_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let requester = LockHolder {
            operation: LockOperation::Delete,
            ..holder(local_host(), DEAD_PID, chrono::Duration::minutes(1))
        };
        let path = store.cancel_path("alpha");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(&requester).unwrap()).unwrap();

        assert!(!store.cancel_requested("alpha").await);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join(STATE_FILE), "{ not json").unwrap();
        let store = StateStore::new(temp_dir.path());

        assert!(matches!(
            store.load().await,
            Err(CloudError::StateError(_))
        ));
    }
}
