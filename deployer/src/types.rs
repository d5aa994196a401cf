//! Types shared across the orchestration core

use std::fmt::{self, Display, Formatter};

use alloy::dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, TxHash, B256, I256, U256};
use serde::{Deserialize, Serialize};

/// The content hash of a compiled contract interface
pub type BuildId = B256;

/// A (network, deployment) pair, the scope of one alias table
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentScope {
    /// The network name, e.g. `mainnet`
    pub network: String,
    /// The deployment name, e.g. `usdc`
    pub deployment: String,
}

impl DeploymentScope {
    /// Construct a new scope
    pub fn new(network: impl ToString, deployment: impl ToString) -> Self {
        Self {
            network: network.to_string(),
            deployment: deployment.to_string(),
        }
    }

    /// The key of the artifact `name` within this scope
    pub fn key(&self, name: impl ToString) -> ArtifactKey {
        ArtifactKey {
            network: self.network.clone(),
            deployment: self.deployment.clone(),
            name: name.to_string(),
        }
    }
}

impl Display for DeploymentScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.deployment)
    }
}

/// Uniquely identifies one logical contract instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    /// The network name
    pub network: String,
    /// The deployment name
    pub deployment: String,
    /// The artifact name within the deployment
    pub name: String,
}

impl ArtifactKey {
    /// The scope this key lives in
    pub fn scope(&self) -> DeploymentScope {
        DeploymentScope::new(&self.network, &self.deployment)
    }
}

impl Display for ArtifactKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.network, self.deployment, self.name)
    }
}

/// A previously produced on-chain artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    /// The address of the contract
    pub address: Address,
    /// The constructor arguments it was deployed with
    #[serde(default)]
    pub constructor_args: Vec<AbiValue>,
    /// The build it was deployed from, `None` for contracts this tool did not deploy
    #[serde(default)]
    pub build_id: Option<BuildId>,
    /// Whether the contract sits behind a proxy
    #[serde(default)]
    pub is_proxy_target: bool,
}

impl ArtifactRecord {
    /// A record for a pre-existing contract
    pub fn existing(address: Address, build_id: Option<BuildId>) -> Self {
        Self {
            address,
            constructor_args: Vec::new(),
            build_id,
            is_proxy_target: false,
        }
    }

    /// A record for a contract discovered by a crawl
    pub fn discovered(address: Address, is_proxy_target: bool) -> Self {
        Self {
            address,
            constructor_args: Vec::new(),
            build_id: None,
            is_proxy_target,
        }
    }
}

/// A contract creation that was submitted but whose receipt has not yet
/// been recorded; a later deploy under the same name waits on it instead of
/// submitting again
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCreation {
    /// The hash of the creation transaction, `None` while the submission
    /// has no known outcome
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    /// The constructor arguments it was submitted with
    #[serde(default)]
    pub constructor_args: Vec<AbiValue>,
    /// The build it was submitted from
    #[serde(default)]
    pub build_id: Option<BuildId>,
}

/// A typed ABI value, used for constructor and call arguments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AbiValue {
    /// An `address`
    Address(Address),
    /// A `uint256`
    Uint(U256),
    /// An `int256`
    Int(I256),
    /// A `bool`
    Bool(bool),
    /// Dynamic `bytes`
    Bytes(Bytes),
    /// A `bytes32`
    Word(B256),
    /// A `string`
    String(String),
    /// A dynamic array of values of one type
    Array(Vec<AbiValue>),
    /// A tuple
    Tuple(Vec<AbiValue>),
}

impl AbiValue {
    /// Convert to the dynamic representation used for encoding
    pub fn to_sol_value(&self) -> DynSolValue {
        match self {
            AbiValue::Address(a) => DynSolValue::Address(*a),
            AbiValue::Uint(v) => DynSolValue::Uint(*v, 256),
            AbiValue::Int(v) => DynSolValue::Int(*v, 256),
            AbiValue::Bool(b) => DynSolValue::Bool(*b),
            AbiValue::Bytes(b) => DynSolValue::Bytes(b.to_vec()),
            AbiValue::Word(w) => DynSolValue::FixedBytes(*w, 32),
            AbiValue::String(s) => DynSolValue::String(s.clone()),
            AbiValue::Array(vs) => DynSolValue::Array(vs.iter().map(Self::to_sol_value).collect()),
            AbiValue::Tuple(vs) => DynSolValue::Tuple(vs.iter().map(Self::to_sol_value).collect()),
        }
    }
}

impl From<Address> for AbiValue {
    fn from(a: Address) -> Self {
        AbiValue::Address(a)
    }
}

impl From<U256> for AbiValue {
    fn from(v: U256) -> Self {
        AbiValue::Uint(v)
    }
}

impl From<u64> for AbiValue {
    fn from(v: u64) -> Self {
        AbiValue::Uint(U256::from(v))
    }
}

impl From<bool> for AbiValue {
    fn from(b: bool) -> Self {
        AbiValue::Bool(b)
    }
}

impl From<Bytes> for AbiValue {
    fn from(b: Bytes) -> Self {
        AbiValue::Bytes(b)
    }
}

impl From<B256> for AbiValue {
    fn from(w: B256) -> Self {
        AbiValue::Word(w)
    }
}

impl From<&str> for AbiValue {
    fn from(s: &str) -> Self {
        AbiValue::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, Address, U256};

    use super::{AbiValue, ArtifactRecord, DeploymentScope};

    #[test]
    fn test_record_json_shape() {
        let record = ArtifactRecord {
            address: address!("1111111111111111111111111111111111111111"),
            constructor_args: vec![
                AbiValue::Address(Address::ZERO),
                AbiValue::Array(vec![AbiValue::Uint(U256::from(3)), AbiValue::Bool(true)]),
            ],
            build_id: None,
            is_proxy_target: true,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["isProxyTarget"], true);
        assert_eq!(json["constructorArgs"][0]["type"], "address");
        assert_eq!(json["constructorArgs"][1]["type"], "array");

        let back: ArtifactRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_tolerates_missing_optional_fields() {
        let record: ArtifactRecord =
            serde_json::from_str(r#"{"address":"0x1111111111111111111111111111111111111111"}"#)
                .unwrap();

        assert!(record.constructor_args.is_empty());
        assert_eq!(record.build_id, None);
        assert!(!record.is_proxy_target);
    }

    #[test]
    fn test_scope_display() {
        let scope = DeploymentScope::new("mainnet", "usdc");
        assert_eq!(scope.to_string(), "mainnet/usdc");
        assert_eq!(scope.key("comet").to_string(), "mainnet/usdc/comet");
        assert_eq!(scope.key("comet").scope(), scope);
    }
}
