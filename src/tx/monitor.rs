//! Background refresh of pending transactions and nonce ledgers

use super::sender::SubmissionCoordinator;
use crate::config::GatewayConfig;

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Concurrent polls per refresh sweep
const POLL_CONCURRENCY: usize = 8;

/// Drives the submission coordinator between client requests
pub struct LifecycleMonitor {
    coordinator: Arc<SubmissionCoordinator>,
    refresh_interval: Duration,
    reconcile_interval: Duration,
    retention: Duration,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl LifecycleMonitor {
    pub fn new(coordinator: Arc<SubmissionCoordinator>, config: &GatewayConfig) -> Self {
        Self {
            coordinator,
            refresh_interval: config.refresh_interval(),
            reconcile_interval: config.nonce_stale_after(),
            retention: config.retention(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main loop
    pub async fn run(&self) {
        let mut refresh = interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = interval(Duration::from_secs(300)); // 5 minutes

        info!("Lifecycle monitor started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = refresh.tick() => {
                    self.refresh_pending().await;
                }

                _ = reconcile.tick() => {
                    self.coordinator.reconcile_all().await;
                }

                _ = cleanup.tick() => {
                    let evicted = self.coordinator.tracker().evict_terminal(self.retention);
                    if evicted > 0 {
                        info!(evicted, "Evicted terminal transactions");
                    }
                }
            }
        }

        info!("Lifecycle monitor stopped");
    }

    /// Poll every pending transaction once. Returns how many reached a
    /// terminal status.
    pub async fn refresh_pending(&self) -> usize {
        let pending = self.coordinator.pending_hashes();
        crate::metrics::set_pending_transactions(pending.len());
        if pending.is_empty() {
            return 0;
        }

        let settled = stream::iter(pending)
            .map(|tx_hash| async move {
                match self.coordinator.poll_status(tx_hash).await {
                    Ok(snapshot) => snapshot.changed,
                    Err(e) => {
                        warn!(?tx_hash, "Background poll failed: {}", e);
                        false
                    }
                }
            })
            .buffer_unordered(POLL_CONCURRENCY)
            .filter(|changed| futures::future::ready(*changed))
            .count()
            .await;

        debug!(settled, "Refresh sweep complete");
        settled
    }

    /// Stop the monitor
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Lifecycle monitor shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use crate::tx::gas::GasEstimator;
    use crate::tx::signer::TransactionSigner;
    use crate::tx::test_support::FakeChain;
    use crate::tx::types::{SubmissionRequest, TransactionStatus, UnsignedTransaction};
    use crate::chain::GasPrice;
    use crate::error::GatewayResult;
    use async_trait::async_trait;
    use ethers::types::{Address, Bytes, U256};

    struct NonceSigner;

    #[async_trait]
    impl TransactionSigner for NonceSigner {
        fn accounts(&self) -> Vec<Address> {
            Vec::new()
        }

        async fn sign(
            &self,
            _account: Address,
            _payload: &UnsignedTransaction,
            nonce: u64,
            _gas_price: &GasPrice,
        ) -> GatewayResult<Bytes> {
            Ok(nonce.to_be_bytes().to_vec().into())
        }
    }

    fn setup() -> (Arc<FakeChain>, Arc<SubmissionCoordinator>, GatewayConfig) {
        let chain = Arc::new(FakeChain::default());
        let config = GatewayConfig::default();
        let coordinator = Arc::new(SubmissionCoordinator::new(
            chain.clone(),
            Arc::new(NonceSigner),
            Arc::new(MemoryStateStore::default()),
            GasEstimator::default(),
            &config,
        ));
        (chain, coordinator, config)
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest::new(
            Address::repeat_byte(0xaa),
            UnsignedTransaction {
                to: Address::repeat_byte(0x01),
                data: Bytes::default(),
                value: U256::zero(),
                gas_limit: U256::from(21_000),
            },
        )
    }

    #[tokio::test]
    async fn test_refresh_settles_mined_transactions() {
        let (chain, coordinator, config) = setup();
        let mined = coordinator.submit(request()).await.unwrap();
        let waiting = coordinator.submit(request()).await.unwrap();
        chain.set_receipt(mined.tx_hash, true, 21_000);

        let monitor = LifecycleMonitor::new(coordinator.clone(), &config);
        assert_eq!(monitor.refresh_pending().await, 1);

        assert!(matches!(
            coordinator.lookup(mined.tx_hash).unwrap().status,
            TransactionStatus::Confirmed(_)
        ));
        assert_eq!(coordinator.pending_hashes(), vec![waiting.tx_hash]);
    }

    #[tokio::test]
    async fn test_refresh_survives_poll_errors() {
        let (chain, coordinator, config) = setup();
        let submission = coordinator.submit(request()).await.unwrap();
        chain.fail_receipts(true);

        let monitor = LifecycleMonitor::new(coordinator.clone(), &config);
        assert_eq!(monitor.refresh_pending().await, 0);
        assert_eq!(coordinator.pending_hashes(), vec![submission.tx_hash]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_chain, coordinator, config) = setup();
        let monitor = Arc::new(LifecycleMonitor::new(coordinator, &config));

        let runner = monitor.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_secs(12)).await;
        monitor.stop().await;

        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
