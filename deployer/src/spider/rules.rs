//! Crawl rules: how to recognize a contract kind and which relations to follow

use alloy::dyn_abi::DynSolType;
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use tracing::debug;

use crate::{
    network::{ClientError, NetworkClient},
    retry::RetryPolicy,
    solidity::{decode_returns, encode_call, word_to_address},
    types::AbiValue,
};

use super::manifest::{ContractKind, EdgeKind};

/// The outcome of probing a contract for a relation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe<T> {
    /// The contract exposes the relation
    Applicable(T),
    /// The contract does not expose the relation
    NotApplicable,
}

impl<T> Probe<T> {
    /// The probed value, if the relation applies
    pub fn applicable(self) -> Option<T> {
        match self {
            Probe::Applicable(v) => Some(v),
            Probe::NotApplicable => None,
        }
    }

    /// Whether the relation applies
    pub fn is_applicable(&self) -> bool {
        matches!(self, Probe::Applicable(_))
    }

    /// Map the probed value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Probe<U> {
        match self {
            Probe::Applicable(v) => Probe::Applicable(f(v)),
            Probe::NotApplicable => Probe::NotApplicable,
        }
    }
}

impl<T> From<Option<T>> for Probe<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Probe::Applicable(v),
            None => Probe::NotApplicable,
        }
    }
}

/// A live contract, as seen by a crawl rule.
///
/// Every read goes through the retry policy. A revert, an empty or
/// undecodable return, or a zero address means the probed relation does not
/// apply; any other failure is returned to the caller.
#[derive(Clone, Copy)]
pub struct ContractHandle<'a> {
    /// The contract address
    address: Address,
    /// The network the contract lives on
    client: &'a dyn NetworkClient,
    /// The retry policy for probes
    retry: &'a RetryPolicy,
}

impl<'a> ContractHandle<'a> {
    /// Construct a handle
    pub fn new(address: Address, client: &'a dyn NetworkClient, retry: &'a RetryPolicy) -> Self {
        Self {
            address,
            client,
            retry,
        }
    }

    /// The contract address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Call `signature` with `args`, returning the raw return data
    pub async fn call(
        &self,
        signature: &str,
        args: &[AbiValue],
    ) -> Result<Probe<Bytes>, ClientError> {
        let calldata =
            encode_call(signature, args).map_err(|e| ClientError::Terminal(e.to_string()))?;

        let res = self
            .retry
            .run(signature, || self.client.call(self.address, calldata.clone()))
            .await;

        match res {
            Ok(data) if data.is_empty() => Ok(Probe::NotApplicable),
            Ok(data) => Ok(Probe::Applicable(data)),
            Err(e) if e.is_revert() => {
                debug!(address = %self.address, signature, cause = %e, "probe reverted");
                Ok(Probe::NotApplicable)
            }
            Err(e) => Err(e),
        }
    }

    /// Call a no-argument getter returning one address
    pub async fn address_getter(&self, signature: &str) -> Result<Probe<Address>, ClientError> {
        let probe = self.call(signature, &[]).await?.map(|data| {
            decode_returns(vec![DynSolType::Address], &data)
                .and_then(|values| values.first().and_then(|v| v.as_address()))
                .filter(|address| !address.is_zero())
        });

        Ok(probe.applicable().flatten().into())
    }

    /// Call a no-argument getter returning a list of addresses; zero entries
    /// are dropped
    pub async fn address_list_getter(
        &self,
        signature: &str,
    ) -> Result<Probe<Vec<Address>>, ClientError> {
        let ty = DynSolType::Array(Box::new(DynSolType::Address));
        let probe = self.call(signature, &[]).await?.map(|data| {
            let values = decode_returns(vec![ty], &data)?;
            let list = values.first()?.as_array()?;
            Some(
                list.iter()
                    .filter_map(|v| v.as_address())
                    .filter(|address| !address.is_zero())
                    .collect::<Vec<_>>(),
            )
        });

        Ok(probe.applicable().flatten().into())
    }

    /// Read an address out of a storage slot
    pub async fn storage_address(&self, slot: B256) -> Result<Probe<Address>, ClientError> {
        let word = self
            .retry
            .run("storage_at", || self.client.storage_at(self.address, slot))
            .await?;

        Ok(word_to_address(word.as_slice())
            .filter(|address| !address.is_zero())
            .into())
    }
}

/// A relation discovered by a rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    /// The edge type
    pub kind: EdgeKind,
    /// The label used to derive the target's alias
    pub label: String,
    /// The referenced contract
    pub target: Address,
    /// An absolute alias for the target
    pub alias: Option<String>,
    /// The kind of the target, when the relation implies it
    pub target_kind: Option<ContractKind>,
}

/// How to recognize one contract kind and which relations to follow from it
#[async_trait]
pub trait ContractRule: Send + Sync {
    /// Whether the contract is of this rule's kind
    async fn identify(&self, contract: &ContractHandle<'_>) -> Result<bool, ClientError>;

    /// The implementation behind the contract, if it is a proxy
    async fn implementation(
        &self,
        _contract: &ContractHandle<'_>,
    ) -> Result<Probe<Address>, ClientError> {
        Ok(Probe::NotApplicable)
    }

    /// The contracts this contract references
    async fn relations(&self, contract: &ContractHandle<'_>) -> Result<Vec<Relation>, ClientError>;
}

/// Where a relation's target address is read from
#[derive(Clone, Debug, PartialEq, Eq)]
enum Source {
    /// A no-argument getter returning an address
    Getter(String),
    /// A no-argument getter returning an address list
    List(String),
    /// A storage slot holding an address
    Slot(B256),
}

impl Source {
    /// Read every target address from the contract
    async fn read(&self, contract: &ContractHandle<'_>) -> Result<Vec<Address>, ClientError> {
        let targets = match self {
            Source::Getter(signature) => contract.address_getter(signature).await?.applicable(),
            Source::Slot(slot) => contract.storage_address(*slot).await?.applicable(),
            Source::List(signature) => {
                return Ok(contract
                    .address_list_getter(signature)
                    .await?
                    .applicable()
                    .unwrap_or_default())
            }
        };

        Ok(targets.into_iter().collect())
    }
}

/// A declarative relation of a [`SignatureRule`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationSpec {
    /// Where the target is read from
    source: Source,
    /// The edge type
    kind: EdgeKind,
    /// The alias label
    label: String,
    /// An absolute alias for the target
    alias: Option<String>,
    /// The kind of the target
    target_kind: Option<ContractKind>,
}

impl RelationSpec {
    /// Construct a relation spec over a source
    fn new(label: &str, source: Source) -> Self {
        Self {
            source,
            kind: EdgeKind::Reference,
            label: label.to_string(),
            alias: None,
            target_kind: None,
        }
    }

    /// A relation read from a getter returning one address
    pub fn getter(label: &str, signature: &str) -> Self {
        Self::new(label, Source::Getter(signature.to_string()))
    }

    /// A relation read from a getter returning an address list; the `i`th
    /// target is labelled `<label>:<i>`
    pub fn list(label: &str, signature: &str) -> Self {
        Self::new(label, Source::List(signature.to_string()))
    }

    /// A relation read from a storage slot
    pub fn slot(label: &str, slot: B256) -> Self {
        Self::new(label, Source::Slot(slot))
    }

    /// Set the edge type
    pub fn kind(mut self, kind: EdgeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Give the target an absolute alias
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Declare the kind of the target
    pub fn target_kind(mut self, kind: &str) -> Self {
        self.target_kind = Some(ContractKind::new(kind));
        self
    }

    /// Read the relations this spec describes
    async fn read(&self, contract: &ContractHandle<'_>) -> Result<Vec<Relation>, ClientError> {
        let targets = self.source.read(contract).await?;
        let indexed = matches!(self.source, Source::List(_));

        let relations = targets
            .into_iter()
            .enumerate()
            .map(|(i, target)| {
                let (label, alias) = if indexed {
                    (
                        format!("{}:{}", self.label, i),
                        self.alias.as_ref().map(|a| format!("{}:{}", a, i)),
                    )
                } else {
                    (self.label.clone(), self.alias.clone())
                };

                Relation {
                    kind: self.kind,
                    label,
                    target,
                    alias,
                    target_kind: self.target_kind.clone(),
                }
            })
            .collect();

        Ok(relations)
    }
}

/// A rule that recognizes a contract by the getters it answers and reads
/// its relations from getters and storage slots
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureRule {
    /// Getters that must all answer for the contract to match
    fingerprint: Vec<String>,
    /// Where the implementation address is read from
    implementation: Option<Source>,
    /// The relations to follow
    relations: Vec<RelationSpec>,
}

impl SignatureRule {
    /// An empty rule; it identifies nothing until given a fingerprint
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the contract to answer a no-argument getter
    pub fn fingerprint(mut self, signature: &str) -> Self {
        self.fingerprint.push(signature.to_string());
        self
    }

    /// Read the implementation address from a getter
    pub fn implementation_getter(mut self, signature: &str) -> Self {
        self.implementation = Some(Source::Getter(signature.to_string()));
        self
    }

    /// Read the implementation address from a storage slot
    pub fn implementation_slot(mut self, slot: B256) -> Self {
        self.implementation = Some(Source::Slot(slot));
        self
    }

    /// Follow a relation
    pub fn relation(mut self, relation: RelationSpec) -> Self {
        self.relations.push(relation);
        self
    }
}

#[async_trait]
impl ContractRule for SignatureRule {
    async fn identify(&self, contract: &ContractHandle<'_>) -> Result<bool, ClientError> {
        if self.fingerprint.is_empty() {
            return Ok(false);
        }

        for signature in &self.fingerprint {
            if !contract.call(signature, &[]).await?.is_applicable() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn implementation(
        &self,
        contract: &ContractHandle<'_>,
    ) -> Result<Probe<Address>, ClientError> {
        let Some(source) = &self.implementation else {
            return Ok(Probe::NotApplicable);
        };

        Ok(source.read(contract).await?.into_iter().next().into())
    }

    async fn relations(&self, contract: &ContractHandle<'_>) -> Result<Vec<Relation>, ClientError> {
        let mut relations = Vec::new();
        for spec in &self.relations {
            relations.extend(spec.read(contract).await?);
        }

        Ok(relations)
    }
}
