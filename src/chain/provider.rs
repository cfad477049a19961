//! Chain provider with multi-RPC support and automatic failover

use super::{BroadcastError, ChainClient, GasPrice, ReceiptSummary, TransactionMetadata};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{GatewayError, GatewayResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> GatewayResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!(chain_id = config.chain_id, %url, "Added HTTP provider");
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(GatewayError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(chain_id = self.config.chain_id, provider = next, "RPC failover");
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> GatewayResult<u64> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(chain_id = self.config.chain_id, "Failed to get block number: {}", e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(GatewayError::network("get block number", last_error))
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> GatewayResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| GatewayError::network("get latest block", e))?
            .ok_or_else(|| GatewayError::network("get latest block", "no latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| GatewayError::Internal("No base fee in block".to_string()))?;

        // 2 gwei tip; the signer adds its own buffer on top
        let priority_fee = U256::from(2_000_000_000u64);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, priority_fee))
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    async fn transaction_count(&self, account: Address) -> GatewayResult<u64> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_count(account, None).await {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(?account, "Failed to get transaction count: {}", e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(GatewayError::network("get transaction count", last_error))
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> GatewayResult<Option<ReceiptSummary>> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt.map(summarize_receipt)),
                Err(e) => {
                    warn!(?tx_hash, "Failed to get transaction receipt: {}", e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(GatewayError::network("get transaction receipt", last_error))
    }

    async fn transaction(&self, tx_hash: H256) -> GatewayResult<Option<TransactionMetadata>> {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction(tx_hash).await {
                Ok(tx) => {
                    return Ok(tx.map(|tx| TransactionMetadata {
                        from: tx.from,
                        nonce: tx.nonce.as_u64(),
                        gas_limit: tx.gas,
                        block_number: tx.block_number.map(|b| b.as_u64()),
                    }))
                }
                Err(e) => {
                    warn!(?tx_hash, "Failed to get transaction: {}", e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(GatewayError::network("get transaction", last_error))
    }

    async fn broadcast(&self, raw: Bytes) -> Result<H256, BroadcastError> {
        // No failover here: a second node may accept what the first already relayed
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => Err(classify_broadcast_error(&e)),
        }
    }

    async fn gas_price(&self) -> GatewayResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| GatewayError::network("get gas price", e))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

fn summarize_receipt(receipt: TransactionReceipt) -> ReceiptSummary {
    ReceiptSummary {
        block_number: receipt.block_number.map(|b| b.as_u64()),
        gas_used: receipt.gas_used.unwrap_or_default(),
        success: receipt.status == Some(U64::from(1)),
        effective_gas_price: receipt.effective_gas_price,
    }
}

/// JSON-RPC error responses mean the node refused the payload; anything else
/// leaves acceptance unknown.
fn classify_broadcast_error(err: &ProviderError) -> BroadcastError {
    match RpcError::as_error_response(err) {
        Some(response) => BroadcastError::Rejected(response.message.clone()),
        None => BroadcastError::Unreachable(err.to_string()),
    }
}
