//! The deployment manager: the façade migrations use to resolve, deploy and
//! talk to the contracts of one (network, deployment) pair

use std::{
    collections::BTreeMap,
    fmt::Display,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use alloy::dyn_abi::DynSolType;
use alloy_primitives::{Address, Bytes, TxHash, B256, U256};
use tracing::{debug, info, warn};

use crate::{
    artifacts::{BuildRegistry, ContractBuild},
    cache::ArtifactCache,
    constants::IMPLEMENTATION_SUFFIX,
    errors::DeployerError,
    network::{ClientError, NetworkClient, Receipt, TransientKind, TxRequest},
    retry::{RetryPolicy, Retryable},
    solidity::{decode_returns, encode_call, word_to_address},
    spider::{RelationManifest, RuleSet, Spider, SpiderConfig},
    types::{AbiValue, ArtifactKey, ArtifactRecord, DeploymentScope, PendingCreation},
};

/// The resolved aliases of one (network, deployment) pair
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasTable {
    /// The records, by alias
    entries: BTreeMap<String, ArtifactRecord>,
}

impl AliasTable {
    /// Build a table from its sources, lowest precedence first: the crawl
    /// manifest, then the artifact cache, then manual overrides
    pub fn merge(
        manifest: Option<&RelationManifest>,
        cached: &BTreeMap<String, ArtifactRecord>,
        manual: &BTreeMap<String, ArtifactRecord>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(manifest) = manifest {
            for (alias, address) in manifest.aliases() {
                let record = ArtifactRecord::discovered(address, manifest.is_proxy_target(address));
                entries.insert(alias, record);
            }
        }

        for (alias, record) in cached.iter().chain(manual.iter()) {
            entries.insert(alias.clone(), record.clone());
        }

        Self { entries }
    }

    /// Look up an alias
    pub fn get(&self, alias: &str) -> Option<&ArtifactRecord> {
        self.entries.get(alias)
    }

    /// The address of an alias
    pub fn address(&self, alias: &str) -> Option<Address> {
        self.get(alias).map(|record| record.address)
    }

    /// Set one alias
    pub fn insert(&mut self, alias: impl ToString, record: ArtifactRecord) {
        self.entries.insert(alias.to_string(), record);
    }

    /// Iterate over the aliases in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArtifactRecord)> {
        self.entries.iter().map(|(alias, record)| (alias.as_str(), record))
    }

    /// The number of aliases
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The in-memory alias state of a manager
#[derive(Default)]
struct AliasState {
    /// The last built table, `None` when it must be rebuilt
    table: Option<AliasTable>,
    /// Aliases set with `put_alias`, which survive rebuilds
    manual: BTreeMap<String, ArtifactRecord>,
    /// Whether the manifest must be re-crawled before the next rebuild
    stale: bool,
}

/// Resolves aliases, deploys or reuses artifacts, and routes every network
/// call through the retry policy
pub struct DeploymentManager {
    /// The (network, deployment) pair this manager serves
    scope: DeploymentScope,
    /// The network client
    client: Arc<dyn NetworkClient>,
    /// The artifact cache
    cache: Arc<ArtifactCache>,
    /// The compiled builds available for deployment
    builds: Arc<BuildRegistry>,
    /// The crawl rules
    rules: Arc<RuleSet>,
    /// The retry policy for network calls
    retry: RetryPolicy,
    /// The crawl bounds
    spider_config: SpiderConfig,
    /// The alias table and its overrides
    state: RwLock<AliasState>,
    /// Serializes crawls
    crawl_lock: tokio::sync::Mutex<()>,
}

impl DeploymentManager {
    /// Construct a manager with no builds, no crawl rules and the default
    /// retry policy
    pub fn new(
        scope: DeploymentScope,
        client: Arc<dyn NetworkClient>,
        cache: Arc<ArtifactCache>,
    ) -> Self {
        Self {
            scope,
            client,
            cache,
            builds: Arc::new(BuildRegistry::default()),
            rules: Arc::new(RuleSet::new()),
            retry: RetryPolicy::default(),
            spider_config: SpiderConfig::default(),
            state: RwLock::new(AliasState::default()),
            crawl_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Set the builds available for deployment
    pub fn with_builds(mut self, builds: Arc<BuildRegistry>) -> Self {
        self.builds = builds;
        self
    }

    /// Set the crawl rules
    pub fn with_rules(mut self, rules: Arc<RuleSet>) -> Self {
        self.rules = rules;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the crawl bounds
    pub fn with_spider_config(mut self, config: SpiderConfig) -> Self {
        self.spider_config = config;
        self
    }

    // -------------
    // | Accessors |
    // -------------

    /// The (network, deployment) pair this manager serves
    pub fn scope(&self) -> &DeploymentScope {
        &self.scope
    }

    /// The network name
    pub fn network(&self) -> &str {
        &self.scope.network
    }

    /// The artifact cache
    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// The network client
    pub fn client(&self) -> &dyn NetworkClient {
        self.client.as_ref()
    }

    /// The retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Look up a compiled build
    pub fn build(&self, name: &str) -> Result<&ContractBuild, DeployerError> {
        self.builds.get(name)
    }

    // --------------
    // | Deployment |
    // --------------

    /// Deploy `build` under `name`, or return the cached artifact.
    ///
    /// Unless `force_new` is set, an artifact already cached under `name` is
    /// returned unchanged without touching the network. Otherwise a creation
    /// transaction is submitted, confirmed and recorded in the cache.
    ///
    /// The creation's hash is persisted before waiting on its receipt, so a
    /// deploy interrupted after submission resumes waiting on the same
    /// transaction rather than creating a second instance.
    pub async fn deploy(
        &self,
        name: &str,
        build: &ContractBuild,
        args: &[AbiValue],
        force_new: bool,
    ) -> Result<ArtifactRecord, DeployerError> {
        let key = self.scope.key(name);
        if !force_new {
            if let Some(record) = self.cache.get(&key) {
                if record.build_id.is_some_and(|id| id != build.id()) {
                    warn!(
                        key = %key,
                        cached_build = ?record.build_id,
                        build = %build.id(),
                        "cached artifact was deployed from a different build, reusing it"
                    );
                }
                debug!(key = %key, address = %record.address, "reusing cached artifact");
                return Ok(record);
            }
        }

        let tx_hash = match self.cache.pending(&key) {
            Some(PendingCreation {
                tx_hash: Some(tx_hash),
                build_id,
                ..
            }) => {
                if build_id.is_some_and(|id| id != build.id()) {
                    warn!(
                        key = %key,
                        pending_build = ?build_id,
                        build = %build.id(),
                        "pending creation was submitted from a different build"
                    );
                }
                info!(key = %key, tx_hash = %tx_hash, "resuming pending creation");
                tx_hash
            }
            Some(_) if !force_new => {
                return Err(DeployerError::ContractDeployment(format!(
                    "an earlier creation of `{}` may have been submitted without a response; \
                     register its address if it landed, or deploy with `force_new`",
                    key
                )));
            }
            _ => self.submit_creation(&key, build, args).await?,
        };

        let receipt = match self.confirm(tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // A reverted creation produced nothing, the next deploy submits afresh
                if matches!(e, DeployerError::Network(ClientError::Revert { .. })) {
                    self.cache.clear_pending(&key)?;
                }
                return Err(e);
            }
        };

        let address = receipt.contract_address.ok_or_else(|| {
            DeployerError::ContractDeployment(format!(
                "receipt of {} has no contract address",
                receipt.tx_hash
            ))
        })?;

        let pending = self.cache.pending(&key);
        let record = ArtifactRecord {
            address,
            constructor_args: pending
                .as_ref()
                .map_or_else(|| args.to_vec(), |p| p.constructor_args.clone()),
            build_id: pending.and_then(|p| p.build_id).or(Some(build.id())),
            is_proxy_target: name.ends_with(IMPLEMENTATION_SUFFIX),
        };
        self.cache.put(&key, &record)?;
        self.cache.clear_pending(&key)?;
        self.reset_table();

        info!(
            key = %key,
            address = %address,
            build = build.name(),
            tx_hash = %receipt.tx_hash,
            "deployed contract"
        );
        Ok(record)
    }

    /// Submit a creation for `key`, marking it pending before the submission
    /// and recording its hash once known.
    ///
    /// A submission whose outcome is unknown leaves the marker without a
    /// hash, so that later deploys under `key` refuse to create again.
    async fn submit_creation(
        &self,
        key: &ArtifactKey,
        build: &ContractBuild,
        args: &[AbiValue],
    ) -> Result<TxHash, DeployerError> {
        let code = build.creation_code(args)?;
        let mut pending = PendingCreation {
            tx_hash: None,
            constructor_args: args.to_vec(),
            build_id: Some(build.id()),
        };
        self.cache.put_pending(key, &pending)?;

        let tx_hash = match self.submit_transaction(TxRequest::create(code)).await {
            Ok(tx_hash) => tx_hash,
            Err(DeployerError::Network(ClientError::OutcomeUnknown(cause))) => {
                warn!(key = %key, cause = %cause, "creation may have been submitted");
                return Err(ClientError::OutcomeUnknown(cause).into());
            }
            Err(e) => {
                self.cache.clear_pending(key)?;
                return Err(e);
            }
        };

        pending.tx_hash = Some(tx_hash);
        self.cache.put_pending(key, &pending)?;
        Ok(tx_hash)
    }

    /// Register a contract this tool did not deploy under `alias`.
    ///
    /// `network`, when given, must be the network this manager serves.
    /// Nothing is written on-chain.
    pub fn existing(
        &self,
        alias: &str,
        address: Address,
        network: Option<&str>,
        interface: Option<&ContractBuild>,
    ) -> Result<ArtifactRecord, DeployerError> {
        if let Some(network) = network.filter(|n| *n != self.scope.network) {
            return Err(DeployerError::Configuration(format!(
                "`{}` is on network `{}`, but this manager serves `{}`",
                alias, network, self.scope.network
            )));
        }

        let key = self.scope.key(alias);
        let record = ArtifactRecord::existing(address, interface.map(ContractBuild::id));
        self.cache.put(&key, &record)?;
        self.cache.clear_pending(&key)?;
        self.reset_table();

        info!(scope = %self.scope, alias, address = %address, "registered existing contract");
        Ok(record)
    }

    /// The cached record of `name`, without consulting the alias table
    pub fn artifact(&self, name: &str) -> Option<ArtifactRecord> {
        self.cache.get(&self.scope.key(name))
    }

    // ---------------
    // | Alias table |
    // ---------------

    /// The resolved alias table.
    ///
    /// Crawls first when crawl roots are configured and the stored manifest
    /// is missing, was crawled from different roots, or was invalidated.
    pub async fn contracts(&self) -> Result<AliasTable, DeployerError> {
        if let Some(table) = self.cached_table() {
            return Ok(table);
        }

        let _crawl = self.crawl_lock.lock().await;
        if let Some(table) = self.cached_table() {
            return Ok(table);
        }

        let stale = self.read_state(|state| state.stale);
        let roots = self.cache.roots(&self.scope);
        let mut manifest = self.cache.manifest(&self.scope);

        let outdated = manifest.as_ref().map_or(true, |m| m.roots != roots);
        if !roots.is_empty() && (stale || outdated) {
            manifest = Some(self.crawl(roots).await?);
        }

        Ok(self.rebuild(manifest.as_ref()))
    }

    /// Resolve one alias
    pub async fn contract(&self, alias: &str) -> Result<ArtifactRecord, DeployerError> {
        self.contracts()
            .await?
            .get(alias)
            .cloned()
            .ok_or_else(|| DeployerError::MissingAlias(alias.to_string()))
    }

    /// Resolve the address of one alias
    pub async fn address(&self, alias: &str) -> Result<Address, DeployerError> {
        Ok(self.contract(alias).await?.address)
    }

    /// Override one alias in memory; the override survives table rebuilds
    /// but is not persisted
    pub fn put_alias(&self, alias: &str, record: ArtifactRecord) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.manual.insert(alias.to_string(), record.clone());
        if let Some(table) = state.table.as_mut() {
            table.insert(alias, record);
        }
    }

    /// Persist a crawl root and force a re-crawl
    pub fn set_root(&self, alias: &str, address: Address) -> Result<(), DeployerError> {
        self.cache.put_root(&self.scope, alias, address)?;
        self.invalidate();
        Ok(())
    }

    /// Force the next `contracts` call to re-crawl
    pub fn invalidate(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.table = None;
        state.stale = true;
    }

    /// Re-crawl from the configured roots now and rebuild the alias table
    pub async fn spider(&self) -> Result<RelationManifest, DeployerError> {
        let _crawl = self.crawl_lock.lock().await;
        let manifest = self.crawl(self.cache.roots(&self.scope)).await?;
        self.rebuild(Some(&manifest));
        Ok(manifest)
    }

    /// Crawl and persist the manifest
    async fn crawl(
        &self,
        roots: BTreeMap<String, Address>,
    ) -> Result<RelationManifest, DeployerError> {
        info!(scope = %self.scope, roots = roots.len(), "crawling deployment");
        let manifest = Spider::new(self.client.as_ref(), &self.retry, self.rules.as_ref())
            .with_config(self.spider_config.clone())
            .crawl_roots(roots)
            .await?;

        self.cache.put_manifest(&self.scope, &manifest)?;
        Ok(manifest)
    }

    /// Rebuild the alias table from the cache and a manifest
    fn rebuild(&self, manifest: Option<&RelationManifest>) -> AliasTable {
        let cached = self.cache.records(&self.scope);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let table = AliasTable::merge(manifest, &cached, &state.manual);
        state.table = Some(table.clone());
        state.stale = false;
        table
    }

    /// Drop the in-memory table so the next lookup rebuilds it
    fn reset_table(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.table = None;
    }

    /// The current table, if it does not need rebuilding
    fn cached_table(&self) -> Option<AliasTable> {
        self.read_state(|state| state.table.clone())
    }

    /// Read the alias state
    fn read_state<T>(&self, f: impl FnOnce(&AliasState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    // -----------------
    // | Network calls |
    // -----------------

    /// Run `action` under this manager's retry schedule, starting at
    /// `attempt` and bounded by `budget` (the policy's budget if `None`)
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        attempt: u32,
        budget: Option<Duration>,
        action: F,
    ) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = match budget {
            Some(budget) => self.retry.with_budget(budget),
            None => self.retry.clone(),
        };

        policy.run_from(operation, attempt, action).await
    }

    /// Call `signature` on an aliased contract
    pub async fn call(
        &self,
        alias: &str,
        signature: &str,
        args: &[AbiValue],
    ) -> Result<Bytes, DeployerError> {
        let address = self.address(alias).await?;
        self.call_at(address, signature, args).await
    }

    /// Call `signature` on a contract by address
    pub async fn call_at(
        &self,
        address: Address,
        signature: &str,
        args: &[AbiValue],
    ) -> Result<Bytes, DeployerError> {
        let calldata = encode_call(signature, args)?;
        self.call_raw(address, calldata).await
    }

    /// Call a contract with prebuilt calldata
    pub async fn call_raw(&self, address: Address, calldata: Bytes) -> Result<Bytes, DeployerError> {
        let client = self.client.as_ref();
        let calldata = &calldata;

        let data = self
            .retry
            .run("call", move || client.call(address, calldata.clone()))
            .await?;
        Ok(data)
    }

    /// Call a getter returning one address
    pub async fn read_address(
        &self,
        alias: &str,
        signature: &str,
        args: &[AbiValue],
    ) -> Result<Address, DeployerError> {
        let data = self.call(alias, signature, args).await?;
        decode_returns(vec![DynSolType::Address], &data)
            .and_then(|values| values.first().and_then(|v| v.as_address()))
            .ok_or_else(|| DeployerError::ReturnDecoding(format!("{} on `{}`", signature, alias)))
    }

    /// Call a getter returning one unsigned integer
    pub async fn read_uint(
        &self,
        alias: &str,
        signature: &str,
        args: &[AbiValue],
    ) -> Result<U256, DeployerError> {
        let data = self.call(alias, signature, args).await?;
        decode_returns(vec![DynSolType::Uint(256)], &data)
            .and_then(|values| values.first().and_then(|v| v.as_uint()).map(|(v, _)| v))
            .ok_or_else(|| DeployerError::ReturnDecoding(format!("{} on `{}`", signature, alias)))
    }

    /// Read an address out of a storage slot of an aliased contract
    pub async fn storage_address(&self, alias: &str, slot: B256) -> Result<Address, DeployerError> {
        let address = self.address(alias).await?;
        let client = self.client.as_ref();

        let word = self
            .retry
            .run("storage_at", move || client.storage_at(address, slot))
            .await?;

        word_to_address(word.as_slice()).ok_or_else(|| {
            DeployerError::ReturnDecoding(format!("slot {} of `{}` is not an address", slot, alias))
        })
    }

    /// Submit a call to an aliased contract and wait for confirmation
    pub async fn send(
        &self,
        alias: &str,
        signature: &str,
        args: &[AbiValue],
        value: U256,
    ) -> Result<Receipt, DeployerError> {
        let address = self.address(alias).await?;
        let calldata = encode_call(signature, args)?;
        self.send_to(address, calldata, value).await
    }

    /// Submit raw calldata to a contract and wait for confirmation
    pub async fn send_to(
        &self,
        to: Address,
        calldata: Bytes,
        value: U256,
    ) -> Result<Receipt, DeployerError> {
        self.submit(TxRequest::call(to, calldata).with_value(value)).await
    }

    /// Submit a transaction and wait for a successful receipt
    async fn submit(&self, tx: TxRequest) -> Result<Receipt, DeployerError> {
        let tx_hash = self.submit_transaction(tx).await?;
        self.confirm(tx_hash).await
    }

    /// Submit a transaction, retrying only failures that prove the endpoint
    /// rejected it
    async fn submit_transaction(&self, tx: TxRequest) -> Result<TxHash, DeployerError> {
        let client = self.client.as_ref();
        let tx = &tx;

        let tx_hash = self
            .retry
            .run("send_transaction", move || async move {
                client
                    .send_transaction(tx.clone())
                    .await
                    .map_err(ambiguous_submission)
            })
            .await?;
        Ok(tx_hash)
    }

    /// Wait for the receipt of a submitted transaction, failing if it reverted
    async fn confirm(&self, tx_hash: TxHash) -> Result<Receipt, DeployerError> {
        let client = self.client.as_ref();
        let receipt = self
            .retry
            .run("wait_for_confirmation", move || {
                client.wait_for_confirmation(tx_hash)
            })
            .await?;

        if !receipt.success {
            return Err(ClientError::Revert {
                reason: format!("transaction {} reverted", tx_hash),
                data: Bytes::new(),
            }
            .into());
        }

        debug!(tx_hash = %tx_hash, block = ?receipt.block_number, "transaction confirmed");
        Ok(receipt)
    }
}

/// Make a failed submission terminal unless the endpoint explicitly rejected
/// the transaction.
///
/// Timeouts, dropped connections and `already known` responses leave open
/// whether the transaction was accepted, and resubmitting would sign it
/// again under a fresh nonce.
fn ambiguous_submission(err: ClientError) -> ClientError {
    match err {
        ClientError::Transient {
            kind: TransientKind::RateLimited | TransientKind::NonceTooLow,
            ..
        } => err,
        ClientError::Transient { kind, message } => {
            ClientError::OutcomeUnknown(format!("{}: {}", kind, message))
        }
        err => err,
    }
}
