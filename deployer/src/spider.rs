//! The relation crawler: discovers a deployment's contracts by walking live
//! on-chain references from a set of named roots

pub mod manifest;
pub mod rules;

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use alloy_primitives::Address;
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::{
    constants::{
        DEFAULT_CRAWL_CONCURRENCY, DEFAULT_MAX_CRAWL_NODES, DEFAULT_ROOT_ALIAS,
        IMPLEMENTATION_LABEL,
    },
    errors::DeployerError,
    network::{ClientError, NetworkClient},
    retry::RetryPolicy,
};

pub use manifest::{ContractKind, Edge, EdgeKind, ManifestNode, RelationManifest};
pub use rules::{ContractHandle, ContractRule, Probe, Relation, RelationSpec, SignatureRule};

/// The crawl rules, keyed by the contract kind they describe.
///
/// Kinds are identified in key order.
pub type RuleSet = BTreeMap<ContractKind, Arc<dyn ContractRule>>;

/// Bounds on a single crawl
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpiderConfig {
    /// The number of contracts probed concurrently
    pub max_concurrency: usize,
    /// The number of contracts a crawl may discover before it is aborted
    pub max_nodes: usize,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CRAWL_CONCURRENCY,
            max_nodes: DEFAULT_MAX_CRAWL_NODES,
        }
    }
}

/// One expanded contract: its kind and outgoing edges
struct Expansion {
    /// The contract address
    address: Address,
    /// The resolved kind
    kind: ContractKind,
    /// The outgoing edges, with the kind each target is hinted to be
    edges: Vec<(Edge, Option<ContractKind>)>,
}

/// The kind the parents of a contract agree it is
#[derive(Clone, Debug, PartialEq, Eq)]
enum KindHint {
    /// No parent named a kind
    Unhinted,
    /// Every parent that named a kind named this one
    Hinted(ContractKind),
    /// Parents named different kinds
    Conflicting,
}

impl KindHint {
    /// Fold in one parent's hint; the result does not depend on fold order
    fn merge(self, hint: Option<ContractKind>) -> Self {
        match (self, hint) {
            (current, None) => current,
            (KindHint::Unhinted, Some(kind)) => KindHint::Hinted(kind),
            (KindHint::Hinted(current), Some(kind)) if current == kind => KindHint::Hinted(current),
            _ => KindHint::Conflicting,
        }
    }

    /// The kind to expand with; conflicting hints fall back to identification
    fn into_kind(self, address: Address) -> Option<ContractKind> {
        match self {
            KindHint::Hinted(kind) => Some(kind),
            KindHint::Conflicting => {
                debug!(address = %address, "parents disagree on the kind, identifying");
                None
            }
            KindHint::Unhinted => None,
        }
    }
}

/// A crawler over one network
pub struct Spider<'a> {
    /// The network to crawl
    client: &'a dyn NetworkClient,
    /// The retry policy for probes
    retry: &'a RetryPolicy,
    /// The crawl rules
    rules: &'a RuleSet,
    /// The crawl bounds
    config: SpiderConfig,
}

impl<'a> Spider<'a> {
    /// Construct a crawler with the default bounds
    pub fn new(client: &'a dyn NetworkClient, retry: &'a RetryPolicy, rules: &'a RuleSet) -> Self {
        Self {
            client,
            retry,
            rules,
            config: SpiderConfig::default(),
        }
    }

    /// Set the crawl bounds
    pub fn with_config(mut self, config: SpiderConfig) -> Self {
        self.config = config;
        self
    }

    /// Crawl from a single root, aliased `root`
    pub async fn crawl(&self, root: Address) -> Result<RelationManifest, DeployerError> {
        self.crawl_roots(BTreeMap::from([(DEFAULT_ROOT_ALIAS.to_string(), root)]))
            .await
    }

    /// Crawl from a set of named roots.
    ///
    /// The crawl proceeds one depth at a time, probing up to
    /// `max_concurrency` contracts of a depth at once. Each address is
    /// expanded at most once; an edge to an address that was already visited
    /// is recorded but not followed, so cyclic references terminate. Kind
    /// hints from every parent at one depth are merged before the target is
    /// expanded, so the resulting manifest does not depend on probe timing.
    pub async fn crawl_roots(
        &self,
        roots: BTreeMap<String, Address>,
    ) -> Result<RelationManifest, DeployerError> {
        let mut manifest = RelationManifest::new(roots.clone());
        let concurrency = self.config.max_concurrency.max(1);

        let mut visited: HashSet<Address> = HashSet::new();
        let mut frontier: BTreeMap<Address, KindHint> =
            roots.values().map(|address| (*address, KindHint::Unhinted)).collect();

        while !frontier.is_empty() {
            visited.extend(frontier.keys().copied());
            if visited.len() > self.config.max_nodes {
                return Err(DeployerError::CrawlLimit(self.config.max_nodes));
            }

            let mut expansions: Vec<Expansion> = stream::iter(frontier)
                .map(|(address, hint)| self.expand(address, hint.into_kind(address)))
                .buffer_unordered(concurrency)
                .try_collect()
                .await?;
            expansions.sort_by_key(|expansion| expansion.address);

            let mut next: BTreeMap<Address, KindHint> = BTreeMap::new();
            for expansion in expansions {
                manifest.insert_node(expansion.address, expansion.kind);
                for (edge, target_kind) in expansion.edges {
                    if !visited.contains(&edge.to) {
                        let hint = next.remove(&edge.to).unwrap_or(KindHint::Unhinted);
                        next.insert(edge.to, hint.merge(target_kind));
                    }
                    manifest.insert_edge(edge);
                }
            }
            frontier = next;
        }

        info!(
            roots = roots.len(),
            nodes = manifest.nodes().len(),
            edges = manifest.edges().count(),
            "crawl complete"
        );
        Ok(manifest)
    }

    /// Resolve the kind of one contract and read its outgoing edges
    async fn expand(
        &self,
        address: Address,
        hint: Option<ContractKind>,
    ) -> Result<Expansion, DeployerError> {
        let contract = ContractHandle::new(address, self.client, self.retry);
        let kind = self.resolve_kind(&contract, hint).await?;
        debug!(address = %address, kind = %kind, "expanding contract");

        let mut edges = Vec::new();
        let Some(rule) = self.rules.get(&kind) else {
            return Ok(Expansion {
                address,
                kind,
                edges,
            });
        };

        let implementation = not_applicable_on_revert(rule.implementation(&contract).await)?;
        if let Probe::Applicable(target) = implementation {
            let edge = Edge {
                from: address,
                to: target,
                kind: EdgeKind::ImplementationOf,
                label: IMPLEMENTATION_LABEL.to_string(),
                alias: None,
            };
            edges.push((edge, None));
        }

        let relations = match rule.relations(&contract).await {
            Ok(relations) => relations,
            Err(e) if e.is_revert() => {
                debug!(address = %address, kind = %kind, cause = %e, "relations do not apply");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        for relation in relations {
            let edge = Edge {
                from: address,
                to: relation.target,
                kind: relation.kind,
                label: relation.label,
                alias: relation.alias,
            };
            edges.push((edge, relation.target_kind));
        }

        Ok(Expansion {
            address,
            kind,
            edges,
        })
    }

    /// The hinted kind if a rule exists for it, otherwise the first kind
    /// whose rule identifies the contract
    async fn resolve_kind(
        &self,
        contract: &ContractHandle<'_>,
        hint: Option<ContractKind>,
    ) -> Result<ContractKind, DeployerError> {
        if let Some(kind) = hint.filter(|kind| self.rules.contains_key(kind)) {
            return Ok(kind);
        }

        for (kind, rule) in self.rules.iter() {
            match rule.identify(contract).await {
                Ok(true) => return Ok(kind.clone()),
                Ok(false) => {}
                Err(e) if e.is_revert() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ContractKind::unknown())
    }
}

/// Treat a reverted implementation probe as "not a proxy"
fn not_applicable_on_revert(
    res: Result<Probe<Address>, ClientError>,
) -> Result<Probe<Address>, DeployerError> {
    match res {
        Ok(probe) => Ok(probe),
        Err(e) if e.is_revert() => Ok(Probe::NotApplicable),
        Err(e) => Err(e.into()),
    }
}
