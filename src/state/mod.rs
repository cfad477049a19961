//! Durable state for restart recovery
//!
//! Handles:
//! - Accounts the gateway has submitted for
//! - Tracked transactions and their lifecycle status
//!
//! Persistence is best-effort from the submission path: a failed write is
//! logged and never fails a submission that the node already accepted.

mod manager;
mod memory;

pub use manager::PgStateStore;
pub use memory::MemoryStateStore;

use crate::error::GatewayResult;
use crate::tx::TrackedTransaction;

use async_trait::async_trait;
use ethers::types::Address;

/// Storage backend for gateway state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Remember an account so it is reconciled on restart
    async fn record_account(&self, account: Address) -> GatewayResult<()>;

    async fn known_accounts(&self) -> GatewayResult<Vec<Address>>;

    /// Insert or update a tracked transaction, keyed by hash
    async fn save_transaction(&self, tx: &TrackedTransaction) -> GatewayResult<()>;

    async fn load_transactions(&self) -> GatewayResult<Vec<TrackedTransaction>>;

    async fn health_check(&self) -> GatewayResult<()>;
}
