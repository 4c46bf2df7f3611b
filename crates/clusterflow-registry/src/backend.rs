//! How the registry reaches the cloud and the nodes

use async_trait::async_trait;
use clusterflow_bootstrap::RemoteExecutor;
use clusterflow_cloud::CloudProvider;
use clusterflow_config::ClusterConfig;
use std::sync::Arc;

/// Source of the provider and remote executor for one operation.
///
/// `delete` only knows the region recorded in the descriptor, `create`
/// knows the whole config, so both are resolved per call.
#[async_trait]
pub trait Backend: Send + Sync {
    type Provider: CloudProvider + 'static;
    type Executor: RemoteExecutor + 'static;

    async fn provider(&self, region: &str) -> Arc<Self::Provider>;

    fn executor(&self, config: &ClusterConfig) -> Arc<Self::Executor>;
}

/// Backend that hands out the same provider and executor for every call
pub struct StaticBackend<P, E> {
    provider: Arc<P>,
    executor: Arc<E>,
}

impl<P, E> StaticBackend<P, E> {
    pub fn new(provider: Arc<P>, executor: Arc<E>) -> Self {
        Self { provider, executor }
    }
}

#[async_trait]
impl<P, E> Backend for StaticBackend<P, E>
where
    P: CloudProvider + 'static,
    E: RemoteExecutor + 'static,
{
    type Provider = P;
    type Executor = E;

    async fn provider(&self, _region: &str) -> Arc<P> {
        self.provider.clone()
    }

    fn executor(&self, _config: &ClusterConfig) -> Arc<E> {
        self.executor.clone()
    }
}
