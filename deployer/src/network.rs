//! The capability set the orchestration core consumes from a network endpoint
//!
//! The core never encodes chain specifics beyond what rules and migrations
//! supply; everything it needs from a chain goes through [`NetworkClient`].

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
};

use alloy_primitives::{Address, Bytes, TxHash, B256, U256};
use async_trait::async_trait;

use crate::retry::Retryable;

/// The reason a transient failure is expected to clear on its own
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransientKind {
    /// The request timed out
    Timeout,
    /// The endpoint rate limited the request
    RateLimited,
    /// The account nonce lagged a pending transaction
    NonceTooLow,
    /// The endpoint was temporarily unavailable
    Unavailable,
}

impl Display for TransientKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::RateLimited => write!(f, "rate limited"),
            TransientKind::NonceTooLow => write!(f, "nonce too low"),
            TransientKind::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Errors returned by a [`NetworkClient`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// A failure that is expected to clear on retry
    Transient {
        /// The class of transient failure
        kind: TransientKind,
        /// The message reported by the endpoint
        message: String,
    },
    /// The call or transaction reverted
    Revert {
        /// The revert reason reported by the endpoint
        reason: String,
        /// The raw revert data, if any
        data: Bytes,
    },
    /// A submission that may or may not have reached the chain; sending it
    /// again could execute it twice
    OutcomeUnknown(String),
    /// Any other failure; retrying will not help
    Terminal(String),
}

impl ClientError {
    /// Construct a transient error
    pub fn transient(kind: TransientKind, message: impl ToString) -> Self {
        ClientError::Transient {
            kind,
            message: message.to_string(),
        }
    }

    /// Construct a revert without revert data
    pub fn revert(reason: impl ToString) -> Self {
        ClientError::Revert {
            reason: reason.to_string(),
            data: Bytes::new(),
        }
    }

    /// Whether the error is a revert
    pub fn is_revert(&self) -> bool {
        matches!(self, ClientError::Revert { .. })
    }
}

impl Retryable for ClientError {
    fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transient { kind, message } => {
                write!(f, "transient failure ({}): {}", kind, message)
            }
            ClientError::Revert { reason, data } if data.is_empty() => {
                write!(f, "reverted: {}", reason)
            }
            ClientError::Revert { reason, data } => write!(f, "reverted: {} ({})", reason, data),
            ClientError::OutcomeUnknown(s) => write!(f, "submission outcome unknown: {}", s),
            ClientError::Terminal(s) => write!(f, "{}", s),
        }
    }
}

impl Error for ClientError {}

/// A transaction to submit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    /// The recipient, or `None` for a contract creation
    pub to: Option<Address>,
    /// The calldata, or the creation code for a contract creation
    pub data: Bytes,
    /// The value transferred with the transaction
    pub value: U256,
}

impl TxRequest {
    /// A contract creation transaction
    pub fn create(code: Bytes) -> Self {
        Self {
            to: None,
            data: code,
            value: U256::ZERO,
        }
    }

    /// A call to an existing contract
    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to: Some(to),
            data,
            value: U256::ZERO,
        }
    }

    /// Attach a value to the transaction
    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// An event log emitted by a contract
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// The emitting contract
    pub address: Address,
    /// The indexed topics, event signature first
    pub topics: Vec<B256>,
    /// The non-indexed data
    pub data: Bytes,
    /// The block the log was included in
    pub block_number: Option<u64>,
    /// The transaction that emitted the log
    pub tx_hash: Option<TxHash>,
}

/// A query over event logs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogQuery {
    /// The emitting contract
    pub address: Address,
    /// The event signature hash to filter on
    pub topic0: Option<B256>,
    /// The first block to search
    pub from_block: u64,
    /// The last block to search, the chain head if `None`
    pub to_block: Option<u64>,
}

/// The receipt of a confirmed transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// The transaction hash
    pub tx_hash: TxHash,
    /// The block the transaction was included in
    pub block_number: Option<u64>,
    /// The created contract, for contract creations
    pub contract_address: Option<Address>,
    /// Whether the transaction succeeded
    pub success: bool,
    /// The logs emitted by the transaction
    pub logs: Vec<LogEntry>,
}

/// The operations the core needs from one network
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// The chain ID reported by the endpoint
    async fn chain_id(&self) -> Result<u64, ClientError>;

    /// Execute a read-only call against the latest state
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError>;

    /// Read one storage slot of a contract
    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ClientError>;

    /// Read the runtime code of a contract
    async fn code_at(&self, address: Address) -> Result<Bytes, ClientError>;

    /// Sign and submit a transaction, returning its hash
    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash, ClientError>;

    /// Wait until a submitted transaction is included in a block
    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<Receipt, ClientError>;

    /// Query event logs
    async fn logs(&self, query: LogQuery) -> Result<Vec<LogEntry>, ClientError>;
}
