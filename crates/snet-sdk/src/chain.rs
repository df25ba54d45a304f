//! Ethereum JSON-RPC access: provider construction, bounded reads and
//! receipt polling.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::TxHash;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::TransactionReceipt;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

use crate::config::{is_websocket_endpoint, Timeouts};
use crate::{Result, SdkError};

const RECEIPT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECEIPT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Source of the current block height.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn head_block(&self) -> Result<u64>;
}

/// Connect to an RPC endpoint. A signer, when present, fills and signs
/// every transaction sent through the provider.
pub async fn connect(endpoint: &str, signer: Option<PrivateKeySigner>) -> Result<DynProvider> {
    let endpoint = endpoint.trim();
    let ws = is_websocket_endpoint(endpoint);
    let provider = match signer {
        Some(signer) => {
            let builder = ProviderBuilder::new().wallet(EthereumWallet::from(signer));
            if ws {
                builder
                    .connect_ws(WsConnect::new(endpoint))
                    .await
                    .map_err(|e| SdkError::Config(format!("websocket connect failed: {e}")))?
                    .erased()
            } else {
                builder.connect_http(parse_http(endpoint)?).erased()
            }
        }
        None => {
            let builder = ProviderBuilder::new();
            if ws {
                builder
                    .connect_ws(WsConnect::new(endpoint))
                    .await
                    .map_err(|e| SdkError::Config(format!("websocket connect failed: {e}")))?
                    .erased()
            } else {
                builder.connect_http(parse_http(endpoint)?).erased()
            }
        }
    };
    Ok(provider)
}

fn parse_http(endpoint: &str) -> Result<url::Url> {
    endpoint
        .parse()
        .map_err(|e| SdkError::Config(format!("invalid rpc endpoint {endpoint}: {e}")))
}

/// Run a chain read under `timeout`, mapping both failure modes to `ChainRead`.
pub async fn read<T, E: Display>(
    timeout: Duration,
    what: &str,
    fut: impl std::future::IntoFuture<Output = std::result::Result<T, E>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SdkError::ChainRead(format!("{what} timed out after {timeout:?}")))?
        .map_err(|e| SdkError::ChainRead(format!("{what} failed: {e}")))
}

/// Run a transaction submission under `timeout`, mapping failures to `ChainSubmit`.
pub async fn submit<T, E: Display>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SdkError::ChainSubmit(format!("{what} send timed out after {timeout:?}")))?
        .map_err(|e| SdkError::ChainSubmit(format!("{what} send failed: {e}")))
}

/// Doubling back-off with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Self { next: start, cap }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RECEIPT_BACKOFF_START, RECEIPT_BACKOFF_CAP)
    }
}

/// Poll for a transaction receipt until it is mined or `timeout` elapses.
///
/// An absent receipt means "not mined yet" and is retried with [`Backoff`].
/// A mined but reverted transaction is an error.
pub async fn wait_for_receipt<P: Provider>(
    provider: &P,
    tx_hash: TxHash,
    timeout: Duration,
) -> Result<TransactionReceipt> {
    let poll = async {
        let mut backoff = Backoff::default();
        loop {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {
                    let delay = backoff.next_delay();
                    tracing::debug!(tx = %tx_hash, ?delay, "receipt not available yet");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SdkError::Receipt(format!(
                        "receipt lookup for {tx_hash} failed: {e}"
                    )))
                }
            }
        }
    };

    let receipt = tokio::time::timeout(timeout, poll).await.map_err(|_| {
        SdkError::Receipt(format!("receipt for {tx_hash} not found after {timeout:?}"))
    })??;

    if !receipt.status() {
        return Err(SdkError::Receipt(format!("transaction {tx_hash} reverted")));
    }
    Ok(receipt)
}

/// Shared handle to the RPC connection with the engine's timeouts.
#[derive(Clone)]
pub struct Chain {
    provider: DynProvider,
    timeouts: Timeouts,
}

impl Chain {
    pub fn new(provider: DynProvider, timeouts: Timeouts) -> Self {
        Self { provider, timeouts }
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub async fn chain_id(&self) -> Result<u64> {
        read(self.timeouts.chain_read, "eth_chainId", self.provider.get_chain_id()).await
    }
}

#[async_trait]
impl BlockSource for Chain {
    async fn head_block(&self) -> Result<u64> {
        read(
            self.timeouts.chain_read,
            "eth_blockNumber",
            self.provider.get_block_number(),
        )
        .await
    }
}
