//! Utilities for setting up the deployment managers the commands run against

use std::sync::Arc;

use deployer::{
    artifacts::BuildRegistry,
    cache::ArtifactCache,
    config::NetworksConfig,
    errors::DeployerError,
    manager::DeploymentManager,
    migration::MigrationRegistry,
    rpc::AlloyClient,
    types::DeploymentScope,
};
use tracing::debug;

use crate::{cli::Cli, relations::rules};

/// Everything a command runs against
pub struct Context {
    /// The loaded migrations
    pub registry: MigrationRegistry,
    /// The deployment being operated on
    pub deployment: DeploymentManager,
    /// The deployment holding the governor, when it is a different one
    pub governance: Option<DeploymentManager>,
}

impl Context {
    /// The deployment holding the governor
    pub fn governance(&self) -> &DeploymentManager {
        self.governance.as_ref().unwrap_or(&self.deployment)
    }
}

/// Connect to the deployment and governance networks named on the command
/// line
pub async fn setup_context(cli: &Cli, registry: MigrationRegistry) -> Result<Context, DeployerError> {
    let networks = NetworksConfig::load(&cli.networks_file)?;
    let cache = Arc::new(ArtifactCache::new(&cli.cache_dir));
    let builds = Arc::new(load_builds(cli)?);

    let retry = cli.retry_policy();
    let spider_config = cli.spider_config();

    let setup = |network: String, deployment: String| {
        let networks = &networks;
        let cache = cache.clone();
        let builds = builds.clone();
        let retry = retry.clone();
        let spider_config = spider_config.clone();
        let pkey = cli.pkey.as_deref();

        async move {
            let client = AlloyClient::for_network(&network, networks.get(&network)?, pkey).await?;
            let manager = DeploymentManager::new(
                DeploymentScope::new(network, deployment),
                Arc::new(client),
                cache,
            )
            .with_builds(builds)
            .with_rules(Arc::new(rules()))
            .with_retry(retry)
            .with_spider_config(spider_config);
            Ok::<_, DeployerError>(manager)
        }
    };

    let deployment = setup(cli.network.clone(), cli.deployment.clone()).await?;

    let (gov_network, gov_deployment) = cli.governance_scope();
    let governance = if gov_network == cli.network && gov_deployment == cli.deployment {
        None
    } else {
        Some(setup(gov_network.to_string(), gov_deployment.to_string()).await?)
    };

    Ok(Context {
        registry,
        deployment,
        governance,
    })
}

/// Load the compiled contract artifacts, if the artifacts directory exists
fn load_builds(cli: &Cli) -> Result<BuildRegistry, DeployerError> {
    if !cli.artifacts_dir.is_dir() {
        debug!(dir = %cli.artifacts_dir.display(), "no artifacts directory, deploying is disabled");
        return Ok(BuildRegistry::default());
    }

    BuildRegistry::load(&cli.artifacts_dir)
}
