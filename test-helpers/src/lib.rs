//! Common helpers used in unit and integration tests across the project crates

pub mod mock;

use std::{sync::Arc, time::Duration};

use deployer::{
    cache::ArtifactCache, manager::DeploymentManager, retry::RetryPolicy, types::DeploymentScope,
};
use tempfile::TempDir;

pub use mock::MockNetwork;

/// A retry policy with millisecond backoff, so that retrying tests run fast
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_millis(1), Duration::from_millis(200))
}

/// A deployment manager over a mock network and a throwaway cache
pub struct TestDeployment {
    /// The mock network
    pub network: Arc<MockNetwork>,
    /// The cache shared by every manager built from this deployment
    pub cache: Arc<ArtifactCache>,
    /// The temporary cache directory, removed on drop
    pub dir: TempDir,
}

impl TestDeployment {
    /// Set up a fresh mock network and cache
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create cache dir");
        let cache = Arc::new(ArtifactCache::new(dir.path()));

        Self {
            network: Arc::new(MockNetwork::new()),
            cache,
            dir,
        }
    }

    /// A manager for `network/deployment`, with fast retries
    pub fn manager(&self, network: &str, deployment: &str) -> DeploymentManager {
        DeploymentManager::new(
            DeploymentScope::new(network, deployment),
            self.network.clone(),
            self.cache.clone(),
        )
        .with_retry(fast_retry())
    }
}

impl Default for TestDeployment {
    fn default() -> Self {
        Self::new()
    }
}
