//! Scripted in-memory chain shared by the submission core tests

use crate::chain::{
    BroadcastError, ChainClient, GasPrice, ReceiptSummary, TransactionMetadata,
};
use crate::error::{GatewayError, GatewayResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeChain {
    counts: DashMap<Address, u64>,
    receipts: DashMap<H256, ReceiptSummary>,
    transactions: DashMap<H256, TransactionMetadata>,
    broadcast_failure: Mutex<Option<BroadcastError>>,
    fail_counts: AtomicBool,
    fail_receipts: AtomicBool,
    stall_broadcasts: AtomicBool,
    count_queries: AtomicUsize,
    broadcasts: Mutex<Vec<Bytes>>,
}

impl FakeChain {
    pub fn set_count(&self, account: Address, count: u64) {
        self.counts.insert(account, count);
    }

    pub fn fail_counts(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.fail_receipts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_broadcast(&self, failure: Option<BroadcastError>) {
        *self.broadcast_failure.lock().unwrap() = failure;
    }

    /// Broadcasts reach the node but never answer
    pub fn stall_broadcasts(&self, stall: bool) {
        self.stall_broadcasts.store(stall, Ordering::SeqCst);
    }

    pub fn set_receipt(&self, tx_hash: H256, success: bool, gas_used: u64) {
        self.receipts.insert(
            tx_hash,
            ReceiptSummary {
                block_number: Some(100),
                gas_used: U256::from(gas_used),
                success,
                effective_gas_price: None,
            },
        );
    }

    pub fn set_transaction(&self, tx_hash: H256, gas_limit: u64) {
        self.transactions.insert(
            tx_hash,
            TransactionMetadata {
                from: Address::zero(),
                nonce: 0,
                gas_limit: U256::from(gas_limit),
                block_number: None,
            },
        );
    }

    pub fn forget_transaction(&self, tx_hash: H256) {
        self.transactions.remove(&tx_hash);
    }

    pub fn count_queries(&self) -> usize {
        self.count_queries.load(Ordering::SeqCst)
    }

    pub fn broadcasts(&self) -> Vec<Bytes> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn transaction_count(&self, account: Address) -> GatewayResult<u64> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(GatewayError::network("get transaction count", "connection reset"));
        }
        Ok(self.counts.get(&account).map(|c| *c).unwrap_or(0))
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> GatewayResult<Option<ReceiptSummary>> {
        if self.fail_receipts.load(Ordering::SeqCst) {
            return Err(GatewayError::network("get transaction receipt", "connection reset"));
        }
        Ok(self.receipts.get(&tx_hash).map(|r| r.clone()))
    }

    async fn transaction(&self, tx_hash: H256) -> GatewayResult<Option<TransactionMetadata>> {
        Ok(self.transactions.get(&tx_hash).map(|t| t.clone()))
    }

    async fn broadcast(&self, raw: Bytes) -> Result<H256, BroadcastError> {
        if let Some(failure) = self.broadcast_failure.lock().unwrap().clone() {
            return Err(failure);
        }
        let tx_hash = H256::from(keccak256(&raw));
        self.broadcasts.lock().unwrap().push(raw);
        if self.stall_broadcasts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(tx_hash)
    }

    async fn gas_price(&self) -> GatewayResult<GasPrice> {
        Ok(GasPrice::Legacy(U256::from(1_000_000_000u64)))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
