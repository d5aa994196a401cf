//! An in-memory [`NetworkClient`] with scripted responses

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_primitives::{keccak256, Address, Bytes, Selector, TxHash, B256, U256};
use async_trait::async_trait;
use deployer::{
    encode_args, selector,
    network::{ClientError, LogEntry, LogQuery, NetworkClient, Receipt, TransientKind, TxRequest},
    types::AbiValue,
};

/// The chain ID the mock reports
pub const MOCK_CHAIN_ID: u64 = 31337;

/// A scripted response to a call
#[derive(Clone, Debug)]
pub enum Response {
    /// Return the given data
    Return(Bytes),
    /// Revert
    Revert,
    /// Fail with the given error
    Fail(ClientError),
    /// Fail transiently `failures` times, then respond with `then`
    Flaky {
        /// The remaining transient failures
        failures: usize,
        /// The response once the failures are used up
        then: Box<Response>,
    },
}

/// A hook run after a matching transaction is mined
type SendHook = Arc<dyn Fn(&MockNetwork) + Send + Sync>;

/// The mutable state of the mock chain
#[derive(Default)]
struct State {
    /// Scripted call responses
    responses: HashMap<(Address, Selector), Response>,
    /// Addresses that have code
    contracts: HashMap<Address, Bytes>,
    /// Storage words
    storage: HashMap<(Address, B256), B256>,
    /// Mined receipts
    receipts: HashMap<TxHash, Receipt>,
    /// Every transaction submitted, in order
    sent: Vec<TxRequest>,
    /// Errors to return from the next submissions
    send_failures: VecDeque<ClientError>,
    /// Errors to return after mining the next submissions
    lost_responses: VecDeque<ClientError>,
    /// The number of upcoming submissions that are mined but revert
    reverting_sends: usize,
    /// Whether receipt lookups fail
    confirmations_down: bool,
    /// Hooks keyed by the call they follow
    hooks: HashMap<(Address, Selector), Vec<SendHook>>,
    /// Emitted logs
    logs: Vec<LogEntry>,
    /// Call counts
    calls: HashMap<(Address, Selector), usize>,
    /// The number of contract creations
    deployments: usize,
    /// The current block
    block: u64,
}

/// A mock network; every transaction is mined in its own block
#[derive(Default)]
pub struct MockNetwork {
    /// The chain state
    state: Mutex<State>,
}

impl MockNetwork {
    /// An empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the state
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------------
    // | Scripting |
    // -------------

    /// Give `address` code, so unknown selectors revert rather than return
    /// empty data
    pub fn contract(&self, address: Address) {
        self.state()
            .contracts
            .entry(address)
            .or_insert_with(|| Bytes::from_static(&[0xfe]));
    }

    /// Script the response of `signature` on `address`
    pub fn respond(&self, address: Address, signature: &str, response: Response) {
        self.contract(address);
        self.state()
            .responses
            .insert((address, selector(signature)), response);
    }

    /// Script `signature` to return raw data
    pub fn returns(&self, address: Address, signature: &str, data: Bytes) {
        self.respond(address, signature, Response::Return(data));
    }

    /// Script `signature` to return an address
    pub fn returns_address(&self, address: Address, signature: &str, value: Address) {
        self.returns(address, signature, encode_args(&[AbiValue::Address(value)]));
    }

    /// Script `signature` to return an address array
    pub fn returns_addresses(&self, address: Address, signature: &str, values: &[Address]) {
        let values = values.iter().copied().map(AbiValue::Address).collect();
        self.returns(address, signature, encode_args(&[AbiValue::Array(values)]));
    }

    /// Script `signature` to return an unsigned integer
    pub fn returns_uint(&self, address: Address, signature: &str, value: u64) {
        self.returns(address, signature, encode_args(&[AbiValue::Uint(U256::from(value))]));
    }

    /// Script `signature` to revert
    pub fn reverts(&self, address: Address, signature: &str) {
        self.respond(address, signature, Response::Revert);
    }

    /// Script `signature` to fail with `err`
    pub fn fails(&self, address: Address, signature: &str, err: ClientError) {
        self.respond(address, signature, Response::Fail(err));
    }

    /// Script `signature` to fail transiently `failures` times before
    /// returning an address
    pub fn flaky_address(&self, address: Address, signature: &str, failures: usize, value: Address) {
        let then = Box::new(Response::Return(encode_args(&[AbiValue::Address(value)])));
        self.respond(address, signature, Response::Flaky { failures, then });
    }

    /// Store an address in a storage slot
    pub fn set_storage_address(&self, address: Address, slot: B256, value: Address) {
        self.contract(address);
        self.state().storage.insert((address, slot), value.into_word());
    }

    /// Fail the next submission with `err`
    pub fn fail_next_send(&self, err: ClientError) {
        self.state().send_failures.push_back(err);
    }

    /// Mine the next submission, then fail it with `err` as if the response
    /// was lost on the way back
    pub fn lose_next_send_response(&self, err: ClientError) {
        self.state().lost_responses.push_back(err);
    }

    /// Mine the next submission with a failed receipt
    pub fn revert_next_send(&self) {
        self.state().reverting_sends += 1;
    }

    /// Make receipt lookups fail transiently until turned back on
    pub fn set_confirmations_down(&self, down: bool) {
        self.state().confirmations_down = down;
    }

    /// Run `hook` after every mined call of `signature` on `address`
    pub fn on_send(
        &self,
        address: Address,
        signature: &str,
        hook: impl Fn(&MockNetwork) + Send + Sync + 'static,
    ) {
        self.state()
            .hooks
            .entry((address, selector(signature)))
            .or_default()
            .push(Arc::new(hook));
    }

    /// Emit a log in the current block
    pub fn emit(&self, address: Address, topics: Vec<B256>, data: Bytes) {
        let mut state = self.state();
        let block_number = Some(state.block);
        state.logs.push(LogEntry {
            address,
            topics,
            data,
            block_number,
            tx_hash: None,
        });
    }

    // --------------
    // | Inspection |
    // --------------

    /// The current block
    pub fn block_number(&self) -> u64 {
        self.state().block
    }

    /// The number of contract creations mined
    pub fn deployments(&self) -> usize {
        self.state().deployments
    }

    /// The number of times `signature` was called on `address`
    pub fn calls(&self, address: Address, signature: &str) -> usize {
        let state = self.state();
        state
            .calls
            .get(&(address, selector(signature)))
            .copied()
            .unwrap_or_default()
    }

    /// Every transaction submitted, in order
    pub fn sent(&self) -> Vec<TxRequest> {
        self.state().sent.clone()
    }
}

/// The selector of a calldata payload
fn selector_of(data: &[u8]) -> Selector {
    let mut sel = [0u8; 4];
    if let Some(prefix) = data.get(..4) {
        sel.copy_from_slice(prefix);
    }
    Selector::from(sel)
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(MOCK_CHAIN_ID)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError> {
        let key = (to, selector_of(&data));
        let mut state = self.state();
        *state.calls.entry(key).or_default() += 1;

        let has_code = state.contracts.contains_key(&to);
        let response = match state.responses.get_mut(&key) {
            Some(response) => response,
            None if has_code => return Err(ClientError::revert("unknown selector")),
            None => return Ok(Bytes::new()),
        };

        if let Response::Flaky { failures, then } = response {
            if *failures > 0 {
                *failures -= 1;
                return Err(ClientError::transient(TransientKind::Unavailable, "flaky"));
            }
            let then = (**then).clone();
            *response = then;
        }

        match response {
            Response::Return(data) => Ok(data.clone()),
            Response::Revert => Err(ClientError::revert("execution reverted")),
            Response::Fail(err) => Err(err.clone()),
            Response::Flaky { .. } => Err(ClientError::Terminal("nested flaky response".into())),
        }
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ClientError> {
        Ok(self
            .state()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ClientError> {
        Ok(self
            .state()
            .contracts
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash, ClientError> {
        let (tx_hash, hooks, lost) = {
            let mut state = self.state();
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }

            state.block += 1;
            state.sent.push(tx.clone());
            let nonce = state.sent.len() as u64;
            let tx_hash = keccak256(nonce.to_be_bytes());

            let success = state.reverting_sends == 0;
            state.reverting_sends = state.reverting_sends.saturating_sub(1);

            let contract_address = match tx.to {
                Some(_) => None,
                None if !success => None,
                None => {
                    let address = Address::from_word(keccak256(tx_hash));
                    state.contracts.insert(address, tx.data.clone());
                    state.deployments += 1;
                    Some(address)
                }
            };

            let receipt = Receipt {
                tx_hash,
                block_number: Some(state.block),
                contract_address,
                success,
                logs: Vec::new(),
            };
            state.receipts.insert(tx_hash, receipt);

            let hooks = tx
                .to
                .and_then(|to| state.hooks.get(&(to, selector_of(&tx.data))))
                .cloned()
                .filter(|_| success)
                .unwrap_or_default();
            (tx_hash, hooks, state.lost_responses.pop_front())
        };

        for hook in hooks {
            hook(self);
        }
        match lost {
            Some(err) => Err(err),
            None => Ok(tx_hash),
        }
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<Receipt, ClientError> {
        let state = self.state();
        if state.confirmations_down {
            return Err(ClientError::transient(TransientKind::Unavailable, "node down"));
        }

        state
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| ClientError::Terminal(format!("unknown transaction {}", tx_hash)))
    }

    async fn logs(&self, query: LogQuery) -> Result<Vec<LogEntry>, ClientError> {
        let state = self.state();
        let logs = state
            .logs
            .iter()
            .filter(|log| log.address == query.address)
            .filter(|log| query.topic0.map_or(true, |t| log.topics.first() == Some(&t)))
            .filter(|log| {
                let block = log.block_number.unwrap_or_default();
                block >= query.from_block && query.to_block.map_or(true, |to| block <= to)
            })
            .cloned()
            .collect();
        Ok(logs)
    }
}
