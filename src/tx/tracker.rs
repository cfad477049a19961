//! Lifecycle tracking for broadcast transactions
//!
//! Every transaction this process broadcasts is recorded here as `Pending`
//! and moved to a terminal status only on an authoritative chain answer.
//! Transport failures and timeouts never change a record.

use super::gas::GasEstimator;
use super::types::{TrackedTransaction, TransactionStatus};
use crate::chain::ChainClient;
use crate::error::{GatewayError, GatewayResult};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Result of a single poll
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub transaction: TrackedTransaction,
    /// True when this poll moved the record into a terminal status
    pub changed: bool,
}

/// Tracks broadcast transactions through to a terminal status
pub struct LifecycleTracker {
    chain: Arc<dyn ChainClient>,
    gas: GasEstimator,
    /// Bound on each chain call made by `poll`
    poll_timeout: Duration,
    /// Age after which a transaction unknown to the node is dropped
    drop_after: Duration,
    transactions: DashMap<H256, TrackedTransaction>,
    /// (account, nonce) -> latest tx hash using it
    by_nonce: DashMap<(Address, u64), H256>,
}

impl LifecycleTracker {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        gas: GasEstimator,
        poll_timeout: Duration,
        drop_after: Duration,
    ) -> Self {
        Self {
            chain,
            gas,
            poll_timeout,
            drop_after,
            transactions: DashMap::new(),
            by_nonce: DashMap::new(),
        }
    }

    /// Register a newly broadcast transaction.
    ///
    /// A live (non-terminal) record for the same `(account, nonce)` means the
    /// nonce coordinator handed a value out twice; that is reported as an
    /// invariant violation and nothing is recorded.
    pub fn record(&self, transaction: TrackedTransaction) -> GatewayResult<()> {
        let tx_hash = transaction.tx_hash;
        let key = (transaction.account, transaction.nonce);

        if self.transactions.contains_key(&tx_hash) {
            return Err(self.violation(format!("transaction {:?} recorded twice", tx_hash)));
        }

        match self.by_nonce.entry(key) {
            Entry::Occupied(mut existing) => {
                let prior = *existing.get();
                let live = self
                    .transactions
                    .get(&prior)
                    .map(|t| !t.status.is_terminal())
                    .unwrap_or(false);
                if live {
                    return Err(self.violation(format!(
                        "nonce {} of {:?} already tracked by live transaction {:?}",
                        key.1, key.0, prior
                    )));
                }
                existing.insert(tx_hash);
            }
            Entry::Vacant(slot) => {
                slot.insert(tx_hash);
            }
        }

        debug!(?tx_hash, account = ?key.0, nonce = key.1, "Tracking transaction");
        self.transactions.insert(tx_hash, transaction);
        Ok(())
    }

    /// Re-insert a persisted record after restart
    pub fn restore(&self, transaction: TrackedTransaction) {
        let key = (transaction.account, transaction.nonce);
        let tx_hash = transaction.tx_hash;

        // Never let a terminal record shadow a live one for the same nonce
        let shadowed = self
            .by_nonce
            .get(&key)
            .and_then(|h| self.transactions.get(&*h).map(|t| !t.status.is_terminal()))
            .unwrap_or(false);
        if !shadowed || !transaction.status.is_terminal() {
            self.by_nonce.insert(key, tx_hash);
        }
        self.transactions.insert(tx_hash, transaction);
    }

    /// Check the chain once for the transaction's outcome.
    ///
    /// Does not wait for confirmation. Terminal records are returned as-is
    /// without touching the chain.
    pub async fn poll(&self, tx_hash: H256) -> GatewayResult<StatusSnapshot> {
        let current = self
            .lookup(tx_hash)
            .ok_or(GatewayError::TransactionNotFound { tx_hash })?;
        if current.status.is_terminal() {
            return Ok(StatusSnapshot {
                transaction: current,
                changed: false,
            });
        }

        let observed = match self.observe(&current).await {
            Ok(status) => status,
            Err(e) => {
                warn!(?tx_hash, "Poll failed: {}", e);
                crate::metrics::record_poll_error();
                return Err(e);
            }
        };

        let mut record = self
            .transactions
            .get_mut(&tx_hash)
            .ok_or(GatewayError::TransactionNotFound { tx_hash })?;

        let changed = !record.status.is_terminal() && observed.is_terminal();
        if !record.status.is_terminal() {
            record.status = observed;
        }
        record.last_polled_at = Some(Utc::now());
        let transaction = record.clone();
        drop(record);

        if changed {
            info!(
                ?tx_hash,
                account = ?transaction.account,
                nonce = transaction.nonce,
                status = transaction.status.label(),
                "Transaction reached terminal status"
            );
            crate::metrics::record_tx_outcome(transaction.status.label());
        }

        Ok(StatusSnapshot {
            transaction,
            changed,
        })
    }

    /// Classify the chain's current view of a pending transaction
    async fn observe(&self, current: &TrackedTransaction) -> GatewayResult<TransactionStatus> {
        let tx_hash = current.tx_hash;
        let receipt = self
            .bounded(
                "get transaction receipt",
                self.chain.transaction_receipt(tx_hash),
            )
            .await?;

        match receipt {
            Some(receipt) if receipt.success => Ok(TransactionStatus::Confirmed(receipt)),
            Some(receipt) => {
                let metadata = self
                    .bounded("get transaction", self.chain.transaction(tx_hash))
                    .await?;
                match metadata {
                    Some(metadata) => Ok(self.gas.classify(receipt, metadata.gas_limit)),
                    // Mined but the body is gone; no gas limit to diagnose against
                    None => Ok(TransactionStatus::Failed(receipt)),
                }
            }
            None => {
                let age = (Utc::now() - current.submitted_at)
                    .to_std()
                    .unwrap_or_default();
                if age <= self.drop_after {
                    return Ok(TransactionStatus::Pending);
                }

                let known = self
                    .bounded("get transaction", self.chain.transaction(tx_hash))
                    .await?;
                if known.is_some() {
                    Ok(TransactionStatus::Pending)
                } else {
                    Ok(TransactionStatus::Dropped)
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = GatewayResult<T>>,
    ) -> GatewayResult<T> {
        match timeout(self.poll_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    /// Current known state, without contacting the chain
    pub fn lookup(&self, tx_hash: H256) -> Option<TrackedTransaction> {
        self.transactions.get(&tx_hash).map(|t| t.clone())
    }

    /// Hashes of all transactions still pending
    pub fn pending_hashes(&self) -> Vec<H256> {
        self.transactions
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| *t.key())
            .collect()
    }

    /// Drop terminal records last touched more than `older_than` ago.
    /// Pending records are never evicted.
    pub fn evict_terminal(&self, older_than: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(older_than) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };

        let mut evicted = Vec::new();
        self.transactions.retain(|hash, t| {
            let touched = t.last_polled_at.unwrap_or(t.submitted_at);
            let expired = t.status.is_terminal() && touched < cutoff;
            if expired {
                evicted.push((*hash, t.account, t.nonce));
            }
            !expired
        });

        for (hash, account, nonce) in &evicted {
            self.by_nonce
                .remove_if(&(*account, *nonce), |_, current| current == hash);
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted terminal transactions");
        }
        evicted.len()
    }

    /// Record counts by status label
    pub fn stats(&self) -> BTreeMap<&'static str, usize> {
        let mut stats = BTreeMap::new();
        for t in self.transactions.iter() {
            *stats.entry(t.status.label()).or_insert(0) += 1;
        }
        stats
    }

    fn violation(&self, message: String) -> GatewayError {
        error!("Invariant violation: {}", message);
        crate::metrics::record_invariant_violation();
        GatewayError::InvariantViolation(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, ReceiptSummary};
    use crate::tx::test_support::FakeChain;
    use crate::tx::types::Submission;
    use ethers::types::U256;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn account() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn tracked(byte: u8, nonce: u64) -> TrackedTransaction {
        TrackedTransaction::pending(&Submission {
            id: Uuid::new_v4(),
            account: account(),
            nonce,
            tx_hash: H256::repeat_byte(byte),
        })
    }

    fn tracker_with(chain: Arc<dyn ChainClient>) -> LifecycleTracker {
        LifecycleTracker::new(
            chain,
            GasEstimator::default(),
            Duration::from_millis(200),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn test_no_receipt_stays_pending() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        tracker.record(tracked(1, 5)).unwrap();

        let snapshot = tracker.poll(H256::repeat_byte(1)).await.unwrap();
        assert_eq!(snapshot.transaction.status, TransactionStatus::Pending);
        assert!(!snapshot.changed);
        assert!(snapshot.transaction.last_polled_at.is_some());
    }

    #[tokio::test]
    async fn test_success_receipt_confirms() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();
        chain.set_receipt(hash, true, 50_000);

        let snapshot = tracker.poll(hash).await.unwrap();
        assert!(matches!(
            snapshot.transaction.status,
            TransactionStatus::Confirmed(_)
        ));
        assert!(snapshot.changed);
        assert!(tracker.pending_hashes().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_gas_detection() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();
        chain.set_receipt(hash, false, 95_000);
        chain.set_transaction(hash, 100_000);

        let snapshot = tracker.poll(hash).await.unwrap();
        assert!(matches!(
            snapshot.transaction.status,
            TransactionStatus::OutOfGas(ref r) if r.gas_used == U256::from(95_000)
        ));
    }

    #[tokio::test]
    async fn test_revert_at_threshold_is_failed() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();
        chain.set_receipt(hash, false, 90_000);
        chain.set_transaction(hash, 100_000);

        let snapshot = tracker.poll(hash).await.unwrap();
        assert!(matches!(
            snapshot.transaction.status,
            TransactionStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_terminal_polls_are_idempotent() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();
        chain.set_receipt(hash, false, 95_000);
        chain.set_transaction(hash, 100_000);

        let first = tracker.poll(hash).await.unwrap();
        // A later, contradicting observation must not be applied
        chain.set_receipt(hash, true, 21_000);
        let second = tracker.poll(hash).await.unwrap();

        assert_eq!(first.transaction.status, second.transaction.status);
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_terminal_poll_skips_chain() {
        let mut mock = MockChainClient::new();
        mock.expect_transaction_receipt()
            .times(1)
            .returning(|_| {
                Ok(Some(ReceiptSummary {
                    block_number: Some(3),
                    gas_used: U256::from(21_000),
                    success: true,
                    effective_gas_price: None,
                }))
            });
        let tracker = tracker_with(Arc::new(mock));
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();

        assert!(tracker.poll(hash).await.unwrap().changed);
        for _ in 0..3 {
            assert!(!tracker.poll(hash).await.unwrap().changed);
        }
    }

    #[tokio::test]
    async fn test_transport_error_leaves_status_unchanged() {
        let mut mock = MockChainClient::new();
        mock.expect_transaction_receipt()
            .returning(|_| Err(GatewayError::network("get transaction receipt", "eof")));
        let tracker = tracker_with(Arc::new(mock));
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();

        let err = assert_err!(tracker.poll(hash).await);
        assert!(err.is_retryable());
        assert_eq!(
            tracker.lookup(hash).unwrap().status,
            TransactionStatus::Pending
        );
    }

    struct StallingChain;

    #[async_trait::async_trait]
    impl ChainClient for StallingChain {
        async fn transaction_count(&self, _: Address) -> GatewayResult<u64> {
            Ok(0)
        }
        async fn transaction_receipt(&self, _: H256) -> GatewayResult<Option<ReceiptSummary>> {
            std::future::pending().await
        }
        async fn transaction(
            &self,
            _: H256,
        ) -> GatewayResult<Option<crate::chain::TransactionMetadata>> {
            std::future::pending().await
        }
        async fn broadcast(
            &self,
            _: ethers::types::Bytes,
        ) -> Result<H256, crate::chain::BroadcastError> {
            std::future::pending().await
        }
        async fn gas_price(&self) -> GatewayResult<crate::chain::GasPrice> {
            std::future::pending().await
        }
        async fn health_check(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_is_transient() {
        let tracker = tracker_with(Arc::new(StallingChain));
        let hash = H256::repeat_byte(1);
        tracker.record(tracked(1, 5)).unwrap();

        let err = tracker.poll(hash).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(
            tracker.lookup(hash).unwrap().status,
            TransactionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_old_unknown_transaction_is_dropped() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        let hash = H256::repeat_byte(1);
        let mut old = tracked(1, 5);
        old.submitted_at = Utc::now() - chrono::Duration::minutes(30);
        tracker.record(old).unwrap();

        chain.set_transaction(hash, 100_000);
        assert_eq!(
            tracker.poll(hash).await.unwrap().transaction.status,
            TransactionStatus::Pending
        );

        chain.forget_transaction(hash);
        let snapshot = tracker.poll(hash).await.unwrap();
        assert_eq!(snapshot.transaction.status, TransactionStatus::Dropped);
        assert!(snapshot.changed);
    }

    #[tokio::test]
    async fn test_duplicate_live_nonce_is_invariant_violation() {
        let tracker = tracker_with(Arc::new(FakeChain::default()));
        assert_ok!(tracker.record(tracked(1, 5)));

        let err = tracker.record(tracked(2, 5)).unwrap_err();
        assert!(matches!(err, GatewayError::InvariantViolation(_)));
        assert!(err.should_alert());
        assert!(tracker.lookup(H256::repeat_byte(2)).is_none());
    }

    #[tokio::test]
    async fn test_nonce_reusable_after_terminal() {
        let chain = Arc::new(FakeChain::default());
        let tracker = tracker_with(chain.clone());
        let mut old = tracked(1, 5);
        old.status = TransactionStatus::Dropped;
        tracker.record(old).unwrap();

        assert_ok!(tracker.record(tracked(2, 5)));
        assert_eq!(tracker.pending_hashes(), vec![H256::repeat_byte(2)]);
    }

    #[tokio::test]
    async fn test_unknown_hash_not_found() {
        let tracker = tracker_with(Arc::new(FakeChain::default()));
        assert!(matches!(
            tracker.poll(H256::repeat_byte(9)).await,
            Err(GatewayError::TransactionNotFound { .. })
        ));
        assert!(tracker.lookup(H256::repeat_byte(9)).is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_pending() {
        let tracker = tracker_with(Arc::new(FakeChain::default()));
        let mut done = tracked(1, 5);
        done.status = TransactionStatus::Dropped;
        done.submitted_at = Utc::now() - chrono::Duration::hours(2);
        tracker.record(done).unwrap();
        let mut stale_pending = tracked(2, 6);
        stale_pending.submitted_at = Utc::now() - chrono::Duration::hours(2);
        tracker.record(stale_pending).unwrap();

        assert_eq!(tracker.evict_terminal(Duration::from_secs(3600)), 1);
        assert!(tracker.lookup(H256::repeat_byte(1)).is_none());
        assert!(tracker.lookup(H256::repeat_byte(2)).is_some());
        assert_eq!(tracker.stats().get("pending"), Some(&1));
    }
}
