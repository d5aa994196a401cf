//! The relation manifest: the contract graph a crawl discovers

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    fmt::{self, Display, Formatter},
};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::constants::UNKNOWN_KIND;

/// The on-chain kind of a contract, the key of its crawl rule
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractKind(String);

impl ContractKind {
    /// Construct a kind from its name
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string())
    }

    /// The kind of contracts no rule identifies
    pub fn unknown() -> Self {
        Self(UNKNOWN_KIND.to_string())
    }

    /// Whether this is the unknown kind
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_KIND
    }

    /// The kind name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContractKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContractKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The type of a directed edge between two contracts
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// The target is the implementation behind the source proxy
    ImplementationOf,
    /// The target is the asset underlying the source
    UnderlyingOf,
    /// Any other reference from the source to the target
    Reference,
}

/// A discovered contract
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// The contract address
    pub address: Address,
    /// The contract kind
    pub kind: ContractKind,
}

/// A directed, typed edge between two contracts
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// The referencing contract
    pub from: Address,
    /// The referenced contract
    pub to: Address,
    /// The edge type
    pub kind: EdgeKind,
    /// The label used to derive the target's alias from the source's
    pub label: String,
    /// An absolute alias for the target, overriding the derived one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// The graph materialized by a crawl
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationManifest {
    /// The named roots the crawl started from
    pub roots: BTreeMap<String, Address>,
    /// The discovered contracts, sorted by address
    nodes: Vec<ManifestNode>,
    /// The discovered edges
    edges: BTreeSet<Edge>,
}

impl RelationManifest {
    /// An empty manifest over the given roots
    pub fn new(roots: BTreeMap<String, Address>) -> Self {
        Self {
            roots,
            ..Default::default()
        }
    }

    /// Add a node, returning false if the address was already present
    pub fn insert_node(&mut self, address: Address, kind: ContractKind) -> bool {
        match self.nodes.binary_search_by_key(&address, |n| n.address) {
            Ok(_) => false,
            Err(idx) => {
                self.nodes.insert(idx, ManifestNode { address, kind });
                true
            }
        }
    }

    /// Add an edge
    pub fn insert_edge(&mut self, edge: Edge) {
        self.edges.insert(edge);
    }

    /// The kind of a discovered contract
    pub fn node(&self, address: Address) -> Option<&ContractKind> {
        self.nodes
            .binary_search_by_key(&address, |n| n.address)
            .ok()
            .map(|idx| &self.nodes[idx].kind)
    }

    /// The discovered contracts
    pub fn nodes(&self) -> &[ManifestNode] {
        &self.nodes
    }

    /// The discovered edges
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// The edges leaving `address`
    pub fn edges_from(&self, address: Address) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == address)
    }

    /// Whether the contract at `address` sits behind a proxy
    pub fn is_proxy_target(&self, address: Address) -> bool {
        self.edges
            .iter()
            .any(|e| e.kind == EdgeKind::ImplementationOf && e.to == address)
    }

    /// Derive an alias for every contract reachable from the roots.
    ///
    /// Roots keep their names and explicit edge aliases come next. Every
    /// other contract is named `<parent alias>:<label>` after the first
    /// parent that reaches it in a breadth-first walk from the roots in
    /// sorted order, visiting each parent's edges sorted by label. The
    /// result depends only on the node and edge sets.
    pub fn aliases(&self) -> BTreeMap<String, Address> {
        let mut aliases = BTreeMap::new();
        let mut primary: HashMap<Address, String> = HashMap::new();

        let explicit = self
            .edges
            .iter()
            .filter_map(|e| e.alias.as_ref().map(|alias| (alias, e.to)));
        let named = self.roots.iter().map(|(alias, addr)| (alias, *addr)).chain(explicit);

        for (alias, address) in named {
            if aliases.contains_key(alias) {
                continue;
            }
            aliases.insert(alias.clone(), address);
            primary.entry(address).or_insert_with(|| alias.clone());
        }

        let mut visited: HashSet<Address> = self.roots.values().copied().collect();
        let mut queue: VecDeque<Address> = self.roots.values().copied().collect();
        while let Some(parent) = queue.pop_front() {
            let Some(parent_alias) = primary.get(&parent).cloned() else {
                continue;
            };

            let mut children: Vec<&Edge> = self.edges_from(parent).collect();
            children.sort_by(|a, b| (&a.label, a.to).cmp(&(&b.label, b.to)));

            for edge in children {
                if !visited.insert(edge.to) {
                    continue;
                }

                if !primary.contains_key(&edge.to) {
                    let alias = format!("{}:{}", parent_alias, edge.label);
                    if !aliases.contains_key(&alias) {
                        aliases.insert(alias.clone(), edge.to);
                        primary.insert(edge.to, alias);
                    }
                }
                queue.push_back(edge.to);
            }
        }

        aliases
    }
}
