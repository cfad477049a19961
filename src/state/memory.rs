//! In-process state store, used when no database is configured

use super::StateStore;
use crate::error::GatewayResult;
use crate::tx::TrackedTransaction;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ethers::types::{Address, H256};

/// Keeps state for the lifetime of the process only
#[derive(Default)]
pub struct MemoryStateStore {
    accounts: DashSet<Address>,
    transactions: DashMap<H256, TrackedTransaction>,
}

impl MemoryStateStore {
    pub fn transaction(&self, tx_hash: H256) -> Option<TrackedTransaction> {
        self.transactions.get(&tx_hash).map(|t| t.clone())
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn record_account(&self, account: Address) -> GatewayResult<()> {
        self.accounts.insert(account);
        Ok(())
    }

    async fn known_accounts(&self) -> GatewayResult<Vec<Address>> {
        Ok(self.accounts.iter().map(|a| *a).collect())
    }

    async fn save_transaction(&self, tx: &TrackedTransaction) -> GatewayResult<()> {
        self.transactions.insert(tx.tx_hash, tx.clone());
        Ok(())
    }

    async fn load_transactions(&self) -> GatewayResult<Vec<TrackedTransaction>> {
        Ok(self.transactions.iter().map(|t| t.clone()).collect())
    }

    async fn health_check(&self) -> GatewayResult<()> {
        Ok(())
    }
}
