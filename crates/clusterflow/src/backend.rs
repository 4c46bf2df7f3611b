use async_trait::async_trait;
use clusterflow_bootstrap::SshExecutor;
use clusterflow_cloud_aws::Ec2Provider;
use clusterflow_config::ClusterConfig;
use clusterflow_registry::Backend;
use std::sync::Arc;
use std::time::Duration;

/// EC2 + システムの ssh クライアント
pub struct AwsBackend;

#[async_trait]
impl Backend for AwsBackend {
    type Provider = Ec2Provider;
    type Executor = SshExecutor;

    async fn provider(&self, region: &str) -> Arc<Ec2Provider> {
        Arc::new(Ec2Provider::new(region).await)
    }

    fn executor(&self, config: &ClusterConfig) -> Arc<SshExecutor> {
        let connect_timeout = config.timeouts.ssh_retry_interval().max(Duration::from_secs(5));
        Arc::new(
            SshExecutor::new(config.ssh_user.clone(), config.key_path.clone())
                .with_connect_timeout(connect_timeout),
        )
    }
}
