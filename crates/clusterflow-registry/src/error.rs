//! Cluster registry error types

use clusterflow_bootstrap::BootstrapError;
use clusterflow_cloud::CloudError;
use clusterflow_config::ConfigError;
use std::fmt;

/// User-facing error category, stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigError,
    AlreadyExists,
    NotFound,
    Busy,
    TransientProviderError,
    FatalProviderError,
    ProviderUnreachable,
    BootstrapTimeout,
    BootstrapFailed,
    PartialCreateFailure,
    Cancelled,
    StateError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::TransientProviderError => "transient_provider_error",
            ErrorKind::FatalProviderError => "fatal_provider_error",
            ErrorKind::ProviderUnreachable => "provider_unreachable",
            ErrorKind::BootstrapTimeout => "bootstrap_timeout",
            ErrorKind::BootstrapFailed => "bootstrap_failed",
            ErrorKind::PartialCreateFailure => "partial_create_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StateError => "state_error",
        }
    }

    /// Process exit code for this kind
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::ConfigError => 2,
            ErrorKind::AlreadyExists => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Busy => 5,
            ErrorKind::TransientProviderError => 6,
            ErrorKind::FatalProviderError => 7,
            ErrorKind::ProviderUnreachable => 8,
            ErrorKind::BootstrapTimeout => 9,
            ErrorKind::BootstrapFailed => 10,
            ErrorKind::PartialCreateFailure => 11,
            ErrorKind::Cancelled => 12,
            ErrorKind::StateError => 13,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cluster '{0}' already exists (use --resume to continue it)")]
    AlreadyExists(String),

    #[error("Cluster '{0}' not found")]
    NotFound(String),

    #[error("No kubeconfig captured for cluster '{0}'")]
    KubeconfigMissing(String),

    #[error("Cluster '{0}' is busy with another operation")]
    Busy(String),

    #[error("Cluster '{cluster}': {source}")]
    Provider {
        cluster: String,
        #[source]
        source: CloudError,
    },

    #[error(
        "Cluster '{cluster}': bootstrap of {node} failed: {source} (recorded: [{}])",
        .recorded.join(", ")
    )]
    Bootstrap {
        cluster: String,
        node: String,
        recorded: Vec<String>,
        #[source]
        source: BootstrapError,
    },

    #[error(
        "Cluster '{cluster}' is partially created: joined [{}], failed [{}]",
        .joined.join(", "),
        .failed.join("; ")
    )]
    PartialCreateFailure {
        cluster: String,
        joined: Vec<String>,
        /// `node: reason`
        failed: Vec<String>,
    },

    #[error("Operation on cluster '{0}' was cancelled")]
    Cancelled(String),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Config(_) => ErrorKind::ConfigError,
            RegistryError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            RegistryError::NotFound(_) | RegistryError::KubeconfigMissing(_) => {
                ErrorKind::NotFound
            }
            RegistryError::Busy(_) => ErrorKind::Busy,
            RegistryError::Provider { source, .. } => cloud_kind(source),
            RegistryError::Bootstrap { source, .. } => match source {
                BootstrapError::Timeout { .. } => ErrorKind::BootstrapTimeout,
                BootstrapError::Cancelled => ErrorKind::Cancelled,
                _ => ErrorKind::BootstrapFailed,
            },
            RegistryError::PartialCreateFailure { .. } => ErrorKind::PartialCreateFailure,
            RegistryError::Cancelled(_) => ErrorKind::Cancelled,
            RegistryError::State(_) | RegistryError::Io(_) => ErrorKind::StateError,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub(crate) fn provider(cluster: &str, source: CloudError) -> Self {
        match source.root() {
            CloudError::Cancelled => RegistryError::Cancelled(cluster.to_string()),
            _ => RegistryError::Provider {
                cluster: cluster.to_string(),
                source,
            },
        }
    }
}

fn cloud_kind(err: &CloudError) -> ErrorKind {
    match err.root() {
        CloudError::InvalidConfig(_) => ErrorKind::ConfigError,
        CloudError::Transient { .. } => ErrorKind::TransientProviderError,
        CloudError::Fatal { .. } | CloudError::ResourceNotFound(_) => {
            ErrorKind::FatalProviderError
        }
        CloudError::ProviderUnreachable(_) => ErrorKind::ProviderUnreachable,
        // instance never reached running
        CloudError::Timeout(_) => ErrorKind::BootstrapTimeout,
        CloudError::Cancelled => ErrorKind::Cancelled,
        CloudError::LockError(_) => ErrorKind::Busy,
        CloudError::StateError(_)
        | CloudError::Io(_)
        | CloudError::Json(_)
        | CloudError::Provision { .. } => ErrorKind::StateError,
    }
}

impl From<ConfigError> for RegistryError {
    fn from(err: ConfigError) -> Self {
        RegistryError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
