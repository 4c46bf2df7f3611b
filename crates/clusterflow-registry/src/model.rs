//! Cluster registry data model

use chrono::{DateTime, Utc};
use clusterflow_bootstrap::TraceEvent;
use clusterflow_cloud::{ResourceDescriptor, ResourceRole, ResourceStatus};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Options of `create`
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Continue a cluster whose descriptor already exists
    pub resume: bool,
}

/// Outcome of a successful create
#[derive(Debug, Clone)]
pub struct CreateReport {
    pub name: String,
    pub kubeconfig_path: PathBuf,
    /// `(role, status)` of every instance
    pub nodes: Vec<(ResourceRole, ResourceStatus)>,
    pub trace: Vec<TraceEvent>,
}

/// Outcome of a delete
#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub name: String,
    /// Roles torn down, in the order they were removed
    pub removed: Vec<ResourceRole>,
}

/// Overall state of a registered cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Provisioning,
    Ready,
    Degraded,
    Deleting,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// One line of `list`
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub name: String,
    pub region: String,
    pub status: ClusterStatus,
    pub resources: usize,
    pub instances: usize,
    pub main_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ClusterSummary {
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Self {
        let statuses: Vec<ResourceStatus> =
            descriptor.resources.values().map(|r| r.status).collect();
        let instances = descriptor.instance_roles();

        let status = if statuses.contains(&ResourceStatus::Deleting) {
            ClusterStatus::Deleting
        } else if statuses.contains(&ResourceStatus::Failed) {
            ClusterStatus::Degraded
        } else if !instances.is_empty()
            && instances.iter().all(|role| {
                descriptor.get(*role).is_some_and(|r| {
                    matches!(r.status, ResourceStatus::Ready | ResourceStatus::Joined)
                })
            })
        {
            ClusterStatus::Ready
        } else {
            ClusterStatus::Provisioning
        };

        Self {
            name: descriptor.name.clone(),
            region: descriptor.region.clone(),
            status,
            resources: descriptor.resources.len(),
            instances: instances.len(),
            main_ip: descriptor.public_ip(ResourceRole::MainInstance),
            created_at: descriptor.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterflow_cloud::{ResourceKind, ResourceRecord};

    fn descriptor(main: ResourceStatus, worker: ResourceStatus) -> ResourceDescriptor {
        let mut d = ResourceDescriptor::new("demo", "us-east-1");
        d.record(
            ResourceRole::Vpc,
            ResourceRecord::new("vpc-1", ResourceKind::Vpc).with_status(ResourceStatus::Available),
        );
        d.record(
            ResourceRole::MainInstance,
            ResourceRecord::new("i-1", ResourceKind::Instance).with_status(main),
        );
        d.record(
            ResourceRole::WorkerInstance(0),
            ResourceRecord::new("i-2", ResourceKind::Instance).with_status(worker),
        );
        d
    }

    #[test]
    fn test_status_ready_when_all_nodes_done() {
        let summary =
            ClusterSummary::from_descriptor(&descriptor(ResourceStatus::Ready, ResourceStatus::Joined));
        assert_eq!(summary.status, ClusterStatus::Ready);
        assert_eq!(summary.resources, 3);
        assert_eq!(summary.instances, 2);
    }

    #[test]
    fn test_status_degraded_on_failed_node() {
        let summary =
            ClusterSummary::from_descriptor(&descriptor(ResourceStatus::Ready, ResourceStatus::Failed));
        assert_eq!(summary.status, ClusterStatus::Degraded);
    }

    #[test]
    fn test_status_provisioning_while_running() {
        let summary = ClusterSummary::from_descriptor(&descriptor(
            ResourceStatus::Running,
            ResourceStatus::Running,
        ));
        assert_eq!(summary.status, ClusterStatus::Provisioning);
        assert_eq!(summary.main_ip, None);
    }
}
