//! Resource plan: the ordered set of cloud resources a cluster needs
//!
//! [`build_plan`] is a pure function of [`ClusterConfig`]. It validates the
//! shape of the configuration and emits every resource role together with
//! the roles it depends on, in topological order.

use crate::error::{CloudError, Result};
use crate::state::ResourceDescriptor;
use clusterflow_config::ClusterConfig;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

const MIN_VPC_PREFIX: u8 = 16;
const MAX_VPC_PREFIX: u8 = 28;
const SUBNET_PREFIX: u8 = 24;
const SSH_PORT: i32 = 22;
const KUBE_API_PORT: i32 = 6443;

/// Type of action performed on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Attach, route, authorize or otherwise finish a created resource
    Configure,
    /// Delete a resource
    Delete,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Configure => write!(f, "configure"),
            ActionType::Delete => write!(f, "delete"),
        }
    }
}

/// Logical role of a resource within a cluster
///
/// Serialized as `vpc`, `subnet`, ..., `worker_instance[0]`, `gpu_instance[1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ResourceRole {
    Vpc,
    Subnet,
    InternetGateway,
    RouteTable,
    SecurityGroup,
    KeyPair,
    MainInstance,
    WorkerInstance(usize),
    GpuInstance(usize),
}

impl ResourceRole {
    pub fn key(&self) -> String {
        match self {
            ResourceRole::Vpc => "vpc".to_string(),
            ResourceRole::Subnet => "subnet".to_string(),
            ResourceRole::InternetGateway => "internet_gateway".to_string(),
            ResourceRole::RouteTable => "route_table".to_string(),
            ResourceRole::SecurityGroup => "security_group".to_string(),
            ResourceRole::KeyPair => "key_pair".to_string(),
            ResourceRole::MainInstance => "main_instance".to_string(),
            ResourceRole::WorkerInstance(i) => format!("worker_instance[{}]", i),
            ResourceRole::GpuInstance(i) => format!("gpu_instance[{}]", i),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceRole::Vpc => ResourceKind::Vpc,
            ResourceRole::Subnet => ResourceKind::Subnet,
            ResourceRole::InternetGateway => ResourceKind::InternetGateway,
            ResourceRole::RouteTable => ResourceKind::RouteTable,
            ResourceRole::SecurityGroup => ResourceKind::SecurityGroup,
            ResourceRole::KeyPair => ResourceKind::KeyPair,
            ResourceRole::MainInstance
            | ResourceRole::WorkerInstance(_)
            | ResourceRole::GpuInstance(_) => ResourceKind::Instance,
        }
    }

    pub fn is_instance(&self) -> bool {
        self.kind() == ResourceKind::Instance
    }

    /// Node role for instance roles
    pub fn node_role(&self) -> Option<NodeRole> {
        match self {
            ResourceRole::MainInstance => Some(NodeRole::Main),
            ResourceRole::WorkerInstance(_) => Some(NodeRole::CpuWorker),
            ResourceRole::GpuInstance(_) => Some(NodeRole::GpuWorker),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for ResourceRole {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        let indexed = |prefix: &str| -> Option<usize> {
            s.strip_prefix(prefix)?
                .strip_prefix('[')?
                .strip_suffix(']')?
                .parse()
                .ok()
        };

        match s {
            "vpc" => Ok(ResourceRole::Vpc),
            "subnet" => Ok(ResourceRole::Subnet),
            "internet_gateway" => Ok(ResourceRole::InternetGateway),
            "route_table" => Ok(ResourceRole::RouteTable),
            "security_group" => Ok(ResourceRole::SecurityGroup),
            "key_pair" => Ok(ResourceRole::KeyPair),
            "main_instance" => Ok(ResourceRole::MainInstance),
            _ => {
                if let Some(i) = indexed("worker_instance") {
                    Ok(ResourceRole::WorkerInstance(i))
                } else if let Some(i) = indexed("gpu_instance") {
                    Ok(ResourceRole::GpuInstance(i))
                } else {
                    Err(CloudError::StateError(format!("Unknown resource role: {}", s)))
                }
            }
        }
    }
}

impl From<ResourceRole> for String {
    fn from(role: ResourceRole) -> Self {
        role.key()
    }
}

impl TryFrom<String> for ResourceRole {
    type Error = CloudError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Provider-level kind of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    InternetGateway,
    RouteTable,
    SecurityGroup,
    KeyPair,
    Instance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Vpc => write!(f, "vpc"),
            ResourceKind::Subnet => write!(f, "subnet"),
            ResourceKind::InternetGateway => write!(f, "internet_gateway"),
            ResourceKind::RouteTable => write!(f, "route_table"),
            ResourceKind::SecurityGroup => write!(f, "security_group"),
            ResourceKind::KeyPair => write!(f, "key_pair"),
            ResourceKind::Instance => write!(f, "instance"),
        }
    }
}

/// Role a node plays in the Kubernetes cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Main,
    CpuWorker,
    GpuWorker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Main => write!(f, "main"),
            NodeRole::CpuWorker => write!(f, "cpu-worker"),
            NodeRole::GpuWorker => write!(f, "gpu-worker"),
        }
    }
}

/// Inbound security group rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// `tcp`, `udp` or `-1` for all protocols
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr: String,
    pub description: String,
}

/// Instance launch parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub node_role: NodeRole,
    /// Node name suffix (`main`, `cpu-worker-0`, `gpu-worker-1`)
    pub name: String,
    pub instance_type: String,
    /// Provider-resolvable image reference
    pub image: String,
    pub spot_max_price: Option<String>,
}

/// Provider-neutral description of what to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
    Vpc {
        cidr_block: String,
    },
    Subnet {
        cidr_block: String,
        availability_zone: String,
    },
    InternetGateway,
    RouteTable {
        destination: String,
    },
    SecurityGroup {
        description: String,
        ingress: Vec<IngressRule>,
    },
    KeyPair {
        key_name: String,
        public_key_path: PathBuf,
    },
    Instance(InstanceSpec),
}

/// One resource in the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub role: ResourceRole,
    pub depends_on: Vec<ResourceRole>,
    pub spec: ResourceSpec,
}

/// Plan containing every resource of a cluster in creation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePlan {
    pub steps: Vec<PlanStep>,
}

impl ResourcePlan {
    pub fn step(&self, role: ResourceRole) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.role == role)
    }

    pub fn roles(&self) -> Vec<ResourceRole> {
        self.steps.iter().map(|s| s.role).collect()
    }

    /// Position of a role in creation order
    pub fn position(&self, role: ResourceRole) -> Option<usize> {
        self.steps.iter().position(|s| s.role == role)
    }

    /// Non-instance steps, in creation order
    pub fn network_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| !s.role.is_instance())
    }

    pub fn instance_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.role.is_instance())
    }

    pub fn instance_count(&self) -> usize {
        self.instance_steps().count()
    }

    /// Reverse of creation order
    pub fn teardown_order(&self) -> Vec<ResourceRole> {
        self.steps.iter().rev().map(|s| s.role).collect()
    }

    /// Summary of the plan against what a descriptor already records
    pub fn summary(&self, descriptor: Option<&ResourceDescriptor>) -> PlanSummary {
        let recorded = self
            .steps
            .iter()
            .filter(|s| descriptor.is_some_and(|d| d.get(s.role).is_some()))
            .count();

        PlanSummary {
            create: self.steps.len() - recorded,
            no_change: recorded,
            instances: self.instance_count(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub create: usize,
    pub no_change: usize,
    pub instances: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} already recorded ({} instances)",
            self.create, self.no_change, self.instances
        )
    }
}

/// Build the resource plan for a cluster config.
///
/// Never touches the network. Shape errors in the config (malformed CIDR,
/// negative counts, empty required fields) are reported here and nowhere
/// later.
pub fn build_plan(config: &ClusterConfig) -> Result<ResourcePlan> {
    require_non_empty("region", &config.region)?;
    require_non_empty("ami_ssm_parameter", &config.ami_ssm_parameter)?;
    require_non_empty("key_name", &config.key_name)?;
    require_non_empty("main_instance_type", &config.main_instance_type)?;
    require_non_empty("worker_instance_type", &config.worker_instance_type)?;
    require_non_empty("gpu_instance_type", &config.gpu_instance_type)?;
    if config.key_path.as_os_str().is_empty() {
        return Err(CloudError::InvalidConfig("key_path must not be empty".into()));
    }

    if config.num_cpu_workers < 0 {
        return Err(CloudError::InvalidConfig(format!(
            "num_cpu_workers must not be negative (got {})",
            config.num_cpu_workers
        )));
    }
    if config.num_gpu_workers < 0 {
        return Err(CloudError::InvalidConfig(format!(
            "num_gpu_workers must not be negative (got {})",
            config.num_gpu_workers
        )));
    }
    if config.max_parallel_bootstraps == 0 {
        return Err(CloudError::InvalidConfig(
            "max_parallel_bootstraps must be at least 1".into(),
        ));
    }

    let vpc = parse_cidr("vpc_cidr_block", &config.vpc_cidr_block)?;
    if !(MIN_VPC_PREFIX..=MAX_VPC_PREFIX).contains(&vpc.prefix_len()) {
        return Err(CloudError::InvalidConfig(format!(
            "vpc_cidr_block prefix must be between /{} and /{} (got {})",
            MIN_VPC_PREFIX, MAX_VPC_PREFIX, vpc
        )));
    }
    let allowed_ingress = parse_cidr("allowed_ingress", &config.allowed_ingress)?;
    let pod_network = parse_cidr("pod_network_cidr", &config.pod_network_cidr)?;
    if vpc.contains(&pod_network) || pod_network.contains(&vpc) {
        return Err(CloudError::InvalidConfig(format!(
            "pod_network_cidr {} overlaps vpc_cidr_block {}",
            pod_network, vpc
        )));
    }

    let subnet = derive_subnet(vpc)?;
    let instance_deps = vec![
        ResourceRole::Subnet,
        ResourceRole::SecurityGroup,
        ResourceRole::KeyPair,
    ];

    let mut declared = vec![
        PlanStep {
            role: ResourceRole::Vpc,
            depends_on: vec![],
            spec: ResourceSpec::Vpc {
                cidr_block: vpc.to_string(),
            },
        },
        PlanStep {
            role: ResourceRole::Subnet,
            depends_on: vec![ResourceRole::Vpc],
            spec: ResourceSpec::Subnet {
                cidr_block: subnet.to_string(),
                availability_zone: config.availability_zone(),
            },
        },
        PlanStep {
            role: ResourceRole::InternetGateway,
            depends_on: vec![ResourceRole::Vpc],
            spec: ResourceSpec::InternetGateway,
        },
        PlanStep {
            role: ResourceRole::RouteTable,
            depends_on: vec![
                ResourceRole::Vpc,
                ResourceRole::InternetGateway,
                ResourceRole::Subnet,
            ],
            spec: ResourceSpec::RouteTable {
                destination: "0.0.0.0/0".to_string(),
            },
        },
        PlanStep {
            role: ResourceRole::SecurityGroup,
            depends_on: vec![ResourceRole::Vpc],
            spec: ResourceSpec::SecurityGroup {
                description: "Kubernetes cluster nodes".to_string(),
                ingress: vec![
                    IngressRule {
                        protocol: "tcp".into(),
                        from_port: SSH_PORT,
                        to_port: SSH_PORT,
                        cidr: allowed_ingress.to_string(),
                        description: "SSH".into(),
                    },
                    IngressRule {
                        protocol: "tcp".into(),
                        from_port: KUBE_API_PORT,
                        to_port: KUBE_API_PORT,
                        cidr: allowed_ingress.to_string(),
                        description: "Kubernetes API".into(),
                    },
                    IngressRule {
                        protocol: "-1".into(),
                        from_port: -1,
                        to_port: -1,
                        cidr: vpc.to_string(),
                        description: "Cluster internal".into(),
                    },
                ],
            },
        },
        PlanStep {
            role: ResourceRole::KeyPair,
            depends_on: vec![],
            spec: ResourceSpec::KeyPair {
                key_name: config.key_name.clone(),
                public_key_path: config.public_key_path(),
            },
        },
        PlanStep {
            role: ResourceRole::MainInstance,
            depends_on: instance_deps.clone(),
            spec: ResourceSpec::Instance(InstanceSpec {
                node_role: NodeRole::Main,
                name: "main".to_string(),
                instance_type: config.main_instance_type.clone(),
                image: config.ami_ssm_parameter.clone(),
                spot_max_price: config.spot_max_price.clone(),
            }),
        },
    ];

    for i in 0..config.num_cpu_workers as usize {
        declared.push(PlanStep {
            role: ResourceRole::WorkerInstance(i),
            depends_on: instance_deps.clone(),
            spec: ResourceSpec::Instance(InstanceSpec {
                node_role: NodeRole::CpuWorker,
                name: format!("cpu-worker-{}", i),
                instance_type: config.worker_instance_type.clone(),
                image: config.ami_ssm_parameter.clone(),
                spot_max_price: config.spot_max_price.clone(),
            }),
        });
    }

    for i in 0..config.num_gpu_workers as usize {
        declared.push(PlanStep {
            role: ResourceRole::GpuInstance(i),
            depends_on: instance_deps.clone(),
            spec: ResourceSpec::Instance(InstanceSpec {
                node_role: NodeRole::GpuWorker,
                name: format!("gpu-worker-{}", i),
                instance_type: config.gpu_instance_type.clone(),
                image: config.ami_ssm_parameter.clone(),
                spot_max_price: config.spot_max_price.clone(),
            }),
        });
    }

    Ok(ResourcePlan {
        steps: topological_order(declared)?,
    })
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CloudError::InvalidConfig(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn parse_cidr(field: &str, value: &str) -> Result<Ipv4Net> {
    value
        .trim()
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| CloudError::InvalidConfig(format!("{} '{}': {}", field, value, e)))
}

/// First /24 of the VPC, or the VPC range itself when it is already that small
fn derive_subnet(vpc: Ipv4Net) -> Result<Ipv4Net> {
    if vpc.prefix_len() >= SUBNET_PREFIX {
        return Ok(vpc);
    }
    vpc.subnets(SUBNET_PREFIX)
        .ok()
        .and_then(|mut subnets| subnets.next())
        .ok_or_else(|| CloudError::InvalidConfig(format!("cannot derive a subnet from {}", vpc)))
}

/// Kahn's algorithm, picking the earliest declared ready step each round
fn topological_order(declared: Vec<PlanStep>) -> Result<Vec<PlanStep>> {
    for step in &declared {
        for dep in &step.depends_on {
            if !declared.iter().any(|s| s.role == *dep) {
                return Err(CloudError::InvalidConfig(format!(
                    "{} depends on undeclared {}",
                    step.role, dep
                )));
            }
        }
    }

    let mut remaining = declared;
    let mut ordered: Vec<PlanStep> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|step| {
            step.depends_on
                .iter()
                .all(|dep| ordered.iter().any(|done| done.role == *dep))
        });

        match ready {
            Some(index) => ordered.push(remaining.remove(index)),
            None => {
                let stuck: Vec<String> = remaining.iter().map(|s| s.role.key()).collect();
                return Err(CloudError::InvalidConfig(format!(
                    "dependency cycle between: {}",
                    stuck.join(", ")
                )));
            }
        }
    }

    Ok(ordered)
}
