//! A [`NetworkClient`] over an alloy HTTP provider

use std::{str::FromStr, time::Duration};

use alloy::{
    network::{ReceiptResponse, TransactionBuilder},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest},
    signers::local::PrivateKeySigner,
    transports::{http::reqwest::Url, RpcError, TransportErrorKind},
};
use alloy_primitives::{Address, Bytes, TxHash, B256, U256};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    config::NetworkConfig,
    constants::DEFAULT_CONFIRMATION_POLL,
    errors::DeployerError,
    network::{ClientError, LogEntry, LogQuery, NetworkClient, Receipt, TransientKind, TxRequest},
};

/// The JSON-RPC error code nodes use for execution reverts
const EXECUTION_REVERTED_CODE: i64 = 3;
/// The JSON-RPC error code for an exceeded request limit
const LIMIT_EXCEEDED_CODE: i64 = -32005;
/// The HTTP status of a rate limited request
const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// A network client backed by an alloy provider, signing with a local key
#[derive(Clone)]
pub struct AlloyClient {
    /// The provider, with a wallet filler when a key was supplied
    provider: DynProvider,
    /// The interval at which receipts are polled
    poll_interval: Duration,
}

impl AlloyClient {
    /// Connect to an RPC endpoint; without a private key the client can read
    /// but not submit transactions
    pub fn connect(rpc_url: &str, pkey: Option<&str>) -> Result<Self, DeployerError> {
        let url =
            Url::parse(rpc_url).map_err(|e| DeployerError::ClientInitialization(e.to_string()))?;

        let provider = match pkey {
            Some(pkey) => {
                let signer = PrivateKeySigner::from_str(pkey)
                    .map_err(|e| DeployerError::ClientInitialization(e.to_string()))?;
                DynProvider::new(ProviderBuilder::new().wallet(signer).connect_http(url))
            }
            None => DynProvider::new(ProviderBuilder::new().connect_http(url)),
        };

        Ok(Self {
            provider,
            poll_interval: DEFAULT_CONFIRMATION_POLL,
        })
    }

    /// Connect to a configured network, checking that the endpoint serves
    /// the expected chain
    pub async fn for_network(
        network: &str,
        config: &NetworkConfig,
        pkey: Option<&str>,
    ) -> Result<Self, DeployerError> {
        let client = Self::connect(&config.rpc_url(network)?, pkey)?
            .with_poll_interval(config.confirmation_poll());

        if let Some(expected) = config.chain_id {
            let actual = client.chain_id().await?;
            if actual != expected {
                return Err(DeployerError::Configuration(format!(
                    "network `{}` expects chain {} but the endpoint serves chain {}",
                    network, expected, actual
                )));
            }
        }

        info!(network, "connected to network");
        Ok(client)
    }

    /// Set the interval at which receipts are polled
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Classify a JSON-RPC error response
pub fn classify_rpc_message(code: i64, message: &str, data: Option<Bytes>) -> ClientError {
    let lower = message.to_lowercase();

    if code == EXECUTION_REVERTED_CODE || lower.contains("revert") {
        return ClientError::Revert {
            reason: message.to_string(),
            data: data.unwrap_or_default(),
        };
    }

    // The node already holds this exact transaction from an earlier attempt
    if lower.contains("already known") || lower.contains("already imported") {
        return ClientError::OutcomeUnknown(message.to_string());
    }

    let kind = if code == LIMIT_EXCEEDED_CODE
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        Some(TransientKind::RateLimited)
    } else if lower.contains("nonce too low")
        || lower.contains("replacement transaction underpriced")
    {
        Some(TransientKind::NonceTooLow)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Some(TransientKind::Timeout)
    } else if lower.contains("header not found") || lower.contains("unavailable") {
        Some(TransientKind::Unavailable)
    } else {
        None
    };

    match kind {
        Some(kind) => ClientError::transient(kind, message),
        None => ClientError::Terminal(format!("rpc error {}: {}", code, message)),
    }
}

/// Classify an error returned by the provider
fn classify(err: RpcError<TransportErrorKind>) -> ClientError {
    match err {
        RpcError::ErrorResp(payload) => {
            classify_rpc_message(payload.code, &payload.message, payload.as_revert_data())
        }
        RpcError::Transport(TransportErrorKind::HttpError(e))
            if e.status == HTTP_TOO_MANY_REQUESTS =>
        {
            ClientError::transient(TransientKind::RateLimited, e.body)
        }
        RpcError::Transport(kind) => ClientError::transient(TransientKind::Unavailable, kind),
        RpcError::NullResp => ClientError::transient(TransientKind::Unavailable, "null response"),
        e => ClientError::Terminal(e.to_string()),
    }
}

/// Convert an RPC log
fn to_log_entry(log: &Log) -> LogEntry {
    LogEntry {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log.block_number,
        tx_hash: log.transaction_hash,
    }
}

/// Convert an RPC receipt
fn to_receipt(receipt: &TransactionReceipt) -> Receipt {
    Receipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        contract_address: receipt.contract_address,
        success: receipt.status(),
        logs: receipt.inner.logs().iter().map(to_log_entry).collect(),
    }
}

#[async_trait]
impl NetworkClient for AlloyClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        self.provider.get_chain_id().await.map_err(classify)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError> {
        let tx = TransactionRequest::default().with_to(to).with_input(data);
        self.provider.call(tx).await.map_err(classify)
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ClientError> {
        let word = self
            .provider
            .get_storage_at(address, U256::from_be_bytes(slot.0))
            .await
            .map_err(classify)?;

        Ok(B256::from(word.to_be_bytes::<32>()))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ClientError> {
        self.provider.get_code_at(address).await.map_err(classify)
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash, ClientError> {
        let request = match tx.to {
            Some(to) => TransactionRequest::default().with_to(to).with_input(tx.data),
            None => TransactionRequest::default().with_deploy_code(tx.data),
        }
        .with_value(tx.value);

        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(classify)?;

        let tx_hash = *pending.tx_hash();
        debug!(tx_hash = %tx_hash, "submitted transaction");
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<Receipt, ClientError> {
        // No deadline here, the run-level timeout cancels a stuck wait
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(classify)?;

            match receipt {
                Some(receipt) => return Ok(to_receipt(&receipt)),
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn logs(&self, query: LogQuery) -> Result<Vec<LogEntry>, ClientError> {
        let mut filter = Filter::new()
            .address(query.address)
            .from_block(query.from_block);
        if let Some(to_block) = query.to_block {
            filter = filter.to_block(to_block);
        }
        if let Some(topic0) = query.topic0 {
            filter = filter.event_signature(topic0);
        }

        let logs = self.provider.get_logs(&filter).await.map_err(classify)?;
        Ok(logs.iter().map(to_log_entry).collect())
    }
}
