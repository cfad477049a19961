//! Chain module - the gateway's view of the remote chain
//!
//! The submission core only ever talks to the chain through [`ChainClient`],
//! so tests can substitute a scripted chain and the RPC transport stays
//! swappable.

pub mod provider;

pub use provider::ChainProvider;

use crate::error::GatewayResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome data from a mined transaction receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptSummary {
    pub block_number: Option<u64>,
    pub gas_used: U256,
    /// Receipt status flag (true = executed without revert)
    pub success: bool,
    pub effective_gas_price: Option<U256>,
}

/// Transaction fields the lifecycle tracker needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub from: Address,
    pub nonce: u64,
    pub gas_limit: U256,
    pub block_number: Option<u64>,
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Why a raw transaction did not make it into the node
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BroadcastError {
    /// The node answered and refused the transaction
    #[error("rejected by node: {0}")]
    Rejected(String),
    /// The node could not be reached; acceptance is unknown
    #[error("node unreachable: {0}")]
    Unreachable(String),
}

/// Chain capabilities consumed by the submission core.
///
/// Read calls fail with [`crate::error::GatewayError::TransientNetwork`] when
/// the node cannot be reached.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Confirmed transaction count (the next nonce the chain will accept)
    async fn transaction_count(&self, account: Address) -> GatewayResult<u64>;

    async fn transaction_receipt(&self, tx_hash: H256) -> GatewayResult<Option<ReceiptSummary>>;

    async fn transaction(&self, tx_hash: H256) -> GatewayResult<Option<TransactionMetadata>>;

    /// Submit a signed, RLP-encoded transaction
    async fn broadcast(&self, raw: Bytes) -> Result<H256, BroadcastError>;

    async fn gas_price(&self) -> GatewayResult<GasPrice>;

    async fn health_check(&self) -> bool;
}
