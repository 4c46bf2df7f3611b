//! Cloud provider error types

use crate::plan::{ActionType, ResourceRole};
use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rate limiting, eventual consistency lag, dependency still in use.
    /// Safe to retry with backoff.
    #[error("Transient provider error during {operation} ({code}): {message}")]
    Transient {
        operation: String,
        code: String,
        message: String,
    },

    /// Quota, permission, malformed request. Never retried.
    #[error("Provider rejected {operation} ({code}): {message}")]
    Fatal {
        operation: String,
        code: String,
        message: String,
    },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Cannot reach the cloud provider: {0}")]
    ProviderUnreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    /// A plan step failed; carries the role and what is still recorded
    #[error(
        "Failed to {action} {role}: {source} (recorded: [{}])",
        .recorded.join(", ")
    )]
    Provision {
        action: ActionType,
        role: ResourceRole,
        recorded: Vec<String>,
        #[source]
        source: Box<CloudError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn transient(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn fatal(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Fatal {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the retry loop may try this again
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Self::Transient { .. })
    }

    /// The underlying error, looking through `Provision` wrappers
    pub fn root(&self) -> &CloudError {
        match self {
            Self::Provision { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_error_names_role_and_recorded() {
        let err = CloudError::Provision {
            action: ActionType::Create,
            role: ResourceRole::WorkerInstance(1),
            recorded: vec!["vpc=available".into(), "subnet=available".into()],
            source: Box::new(CloudError::fatal(
                "RunInstances",
                "InstanceLimitExceeded",
                "quota",
            )),
        };

        let message = err.to_string();
        assert!(message.contains("worker_instance[1]"));
        assert!(message.contains("vpc=available, subnet=available"));
        assert!(!err.is_transient());
        assert!(matches!(err.root(), CloudError::Fatal { .. }));
    }

    #[test]
    fn test_transient_through_wrapper() {
        let err = CloudError::Provision {
            action: ActionType::Delete,
            role: ResourceRole::SecurityGroup,
            recorded: vec![],
            source: Box::new(CloudError::transient(
                "DeleteSecurityGroup",
                "DependencyViolation",
                "in use",
            )),
        };
        assert!(err.is_transient());
    }
}
