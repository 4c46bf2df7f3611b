//! Classification of EC2 API errors
//!
//! Maps EC2 error codes onto the typed [`CloudError`] kinds so the
//! provisioning driver can retry without inspecting provider strings.

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use clusterflow_cloud::CloudError;

/// Where in the lifecycle the call was made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// create/configure: a missing id is a dependency not visible yet
    Mutate,
    /// describe/delete: a missing id means the resource is gone
    Lookup,
}

/// Codes that resolve on their own given time
const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Unavailable",
    "DependencyViolation",
    "IncorrectState",
    "IncorrectInstanceState",
    "InvalidGroup.InUse",
];

pub fn classify<E, R>(operation: &str, phase: Phase, err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    ) {
        return CloudError::ProviderUnreachable(format!(
            "{}: {}",
            operation,
            DisplayErrorContext(&err)
        ));
    }

    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    classify_code(operation, phase, &code, &message)
}

pub fn classify_code(operation: &str, phase: Phase, code: &str, message: &str) -> CloudError {
    if code.ends_with(".NotFound") {
        return match phase {
            Phase::Mutate => CloudError::transient(operation, code, message),
            Phase::Lookup => CloudError::ResourceNotFound(format!("{} ({})", message, code)),
        };
    }

    if TRANSIENT_CODES.contains(&code) {
        return CloudError::transient(operation, code, message);
    }

    CloudError::fatal(operation, code, message)
}

/// Whether the error carries one of `codes`
pub fn has_code<E, R>(err: &SdkError<E, R>, codes: &[&str]) -> bool
where
    E: ProvideErrorMetadata,
{
    err.code().is_some_and(|code| codes.contains(&code))
}
