//! The network registry: which RPC endpoint serves each named network

use std::{collections::BTreeMap, env, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{constants::DEFAULT_CONFIRMATION_POLL, errors::DeployerError};

/// The configuration of one network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// The RPC endpoint
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// An environment variable holding the RPC endpoint, which takes
    /// precedence over `rpc_url` when set
    #[serde(default)]
    pub rpc_url_env: Option<String>,
    /// The chain ID the endpoint is expected to report
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// The interval at which receipts are polled, in milliseconds
    #[serde(default)]
    pub confirmation_poll_ms: Option<u64>,
}

impl NetworkConfig {
    /// Resolve the RPC endpoint of the network
    pub fn rpc_url(&self, network: &str) -> Result<String, DeployerError> {
        let from_env = self
            .rpc_url_env
            .as_ref()
            .and_then(|var| env::var(var).ok())
            .filter(|url| !url.is_empty());

        from_env.or_else(|| self.rpc_url.clone()).ok_or_else(|| {
            let hint = match &self.rpc_url_env {
                Some(var) => format!(" (set {})", var),
                None => String::new(),
            };
            DeployerError::Configuration(format!("no RPC url for network `{}`{}", network, hint))
        })
    }

    /// The interval at which receipts are polled
    pub fn confirmation_poll(&self) -> Duration {
        self.confirmation_poll_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONFIRMATION_POLL)
    }
}

/// The registry of named networks, read from `networks.json`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworksConfig {
    /// The networks, by name
    networks: BTreeMap<String, NetworkConfig>,
}

impl NetworksConfig {
    /// Read the registry from a JSON file
    pub fn load(path: &Path) -> Result<Self, DeployerError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| DeployerError::Configuration(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    /// Parse the registry from JSON
    pub fn from_json(json: &str) -> Result<Self, DeployerError> {
        serde_json::from_str(json).map_err(|e| DeployerError::Configuration(e.to_string()))
    }

    /// Look up a network
    pub fn get(&self, network: &str) -> Result<&NetworkConfig, DeployerError> {
        self.networks
            .get(network)
            .ok_or_else(|| DeployerError::Configuration(format!("unknown network `{}`", network)))
    }

    /// Add or replace a network
    pub fn insert(&mut self, network: impl ToString, config: NetworkConfig) {
        self.networks.insert(network.to_string(), config);
    }

    /// The names of the configured networks
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::{env, time::Duration};

    use crate::{constants::DEFAULT_CONFIRMATION_POLL, errors::DeployerError};

    use super::NetworksConfig;

    const NETWORKS: &str = r#"{
        "mainnet": { "rpc_url_env": "DEPLOYER_TEST_MAINNET_RPC", "rpc_url": "http://fallback", "chain_id": 1 },
        "local": { "rpc_url": "http://127.0.0.1:8545", "confirmation_poll_ms": 50 },
        "base": { "rpc_url_env": "DEPLOYER_TEST_BASE_RPC" }
    }"#;

    #[test]
    fn test_env_takes_precedence() {
        let networks = NetworksConfig::from_json(NETWORKS).unwrap();
        let mainnet = networks.get("mainnet").unwrap();

        env::remove_var("DEPLOYER_TEST_MAINNET_RPC");
        assert_eq!(mainnet.rpc_url("mainnet").unwrap(), "http://fallback");

        env::set_var("DEPLOYER_TEST_MAINNET_RPC", "http://from-env");
        assert_eq!(mainnet.rpc_url("mainnet").unwrap(), "http://from-env");
        env::remove_var("DEPLOYER_TEST_MAINNET_RPC");
    }

    #[test]
    fn test_missing_url_is_a_configuration_error() {
        let networks = NetworksConfig::from_json(NETWORKS).unwrap();

        env::remove_var("DEPLOYER_TEST_BASE_RPC");
        let err = networks.get("base").unwrap().rpc_url("base").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("DEPLOYER_TEST_BASE_RPC"));

        assert!(matches!(networks.get("goerli"), Err(DeployerError::Configuration(_))));
    }

    #[test]
    fn test_confirmation_poll() {
        let networks = NetworksConfig::from_json(NETWORKS).unwrap();
        assert_eq!(networks.get("local").unwrap().confirmation_poll(), Duration::from_millis(50));
        assert_eq!(networks.get("mainnet").unwrap().confirmation_poll(), DEFAULT_CONFIRMATION_POLL);
        assert_eq!(networks.names().collect::<Vec<_>>(), vec!["base", "local", "mainnet"]);
    }
}
