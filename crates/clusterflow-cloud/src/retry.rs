//! Bounded exponential backoff for provider calls

use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Run `operation`, retrying transient errors with exponential backoff.
///
/// Non-transient errors are returned on first occurrence. When the attempts
/// run out the last transient error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name,
                    attempt,
                    max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!("{} gave up after {} attempts", operation_name, attempt);
                }
                return Err(e);
            }
        }
    }
}

/// Treat "already gone" as success for delete calls
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(CloudError::ResourceNotFound(id)) => {
            tracing::debug!("{} already gone", id);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast(), "CreateVpc", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CloudError::transient("CreateVpc", "Throttling", "slow down"))
            } else {
                Ok("vpc-1")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "vpc-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast(), "RunInstances", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CloudError::fatal("RunInstances", "VcpuLimitExceeded", "quota"))
        })
        .await;

        assert!(matches!(result, Err(CloudError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast(), "CreateSubnet", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CloudError::transient(
                "CreateSubnet",
                "InvalidVpcID.NotFound",
                "not yet visible",
            ))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(CloudError::ResourceNotFound("sg-1".into()))).is_ok());
        assert!(ignore_not_found(Err(CloudError::Cancelled)).is_err());
    }
}
