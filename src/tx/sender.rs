//! Submission coordination: nonce -> sign -> broadcast -> track
//!
//! This is the only code that drives both the nonce coordinator and the
//! lifecycle tracker. A nonce is released only when its transaction certainly
//! never reached the node. Once signed bytes have been handed to the node the
//! nonce stays pending and the transaction is tracked under its locally
//! computed hash, whatever the broadcast outcome.

use super::gas::GasEstimator;
use super::nonce::NonceCoordinator;
use super::signer::TransactionSigner;
use super::tracker::{LifecycleTracker, StatusSnapshot};
use super::types::{
    NonceSelection, Submission, SubmissionRequest, TrackedTransaction, TransactionStatus,
    UnsignedTransaction,
};
use crate::chain::{BroadcastError, ChainClient};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::state::StateStore;

use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A signed transaction handed to the node, outcome not yet known
struct InFlight {
    tracker: Arc<LifecycleTracker>,
    store: Arc<dyn StateStore>,
    record: TrackedTransaction,
}

impl InFlight {
    /// Track under the local hash so the nonce stays pending until the chain
    /// confirms the transaction or the node is seen to have dropped it
    fn track(&self) -> bool {
        match self.tracker.record(self.record.clone()) {
            Ok(()) => true,
            Err(e) => {
                error!(tx_hash = ?self.record.tx_hash, "Failed to track unconfirmed broadcast: {}", e);
                false
            }
        }
    }
}

/// A nonce held by an in-flight submission
struct NonceReservation {
    nonces: Arc<NonceCoordinator>,
    account: Address,
    nonce: u64,
    in_flight: Option<InFlight>,
    armed: bool,
}

impl NonceReservation {
    fn new(nonces: Arc<NonceCoordinator>, account: Address, nonce: u64) -> Self {
        Self {
            nonces,
            account,
            nonce,
            in_flight: None,
            armed: true,
        }
    }

    /// From here on the node may hold the transaction
    fn sent(&mut self, in_flight: InFlight) {
        self.in_flight = Some(in_flight);
    }

    /// The node has the transaction; the nonce stays pending until confirmed
    fn commit(mut self) {
        self.armed = false;
    }

    /// The transaction never reached the node
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.nonces.release(self.account, self.nonce).await {
            warn!(account = ?self.account, nonce = self.nonce, "Nonce release failed: {}", e);
        }
    }

    /// Acceptance unknown: keep the nonce pending
    fn hold(mut self) -> Option<InFlight> {
        self.armed = false;
        self.in_flight.take()
    }
}

impl Drop for NonceReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let (account, nonce) = (self.account, self.nonce);
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!(?account, nonce, "Submission abandoned outside a runtime");
                return;
            }
        };

        match self.in_flight.take() {
            Some(in_flight) => {
                warn!(?account, nonce, "Submission abandoned mid-broadcast; keeping nonce pending");
                if in_flight.track() {
                    handle.spawn(async move {
                        if let Err(e) = in_flight.store.save_transaction(&in_flight.record).await {
                            warn!(?account, nonce, "Failed to persist transaction: {}", e);
                        }
                    });
                }
            }
            None => {
                warn!(?account, nonce, "Submission abandoned; releasing nonce");
                handle.spawn(release_and_invalidate(self.nonces.clone(), account, nonce));
            }
        }
    }
}

async fn release_and_invalidate(nonces: Arc<NonceCoordinator>, account: Address, nonce: u64) {
    if let Err(e) = nonces.release(account, nonce).await {
        warn!(?account, nonce, "Nonce release failed: {}", e);
    }
    nonces.invalidate(account).await;
}

/// Orchestrates one logical submission per request
pub struct SubmissionCoordinator {
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn TransactionSigner>,
    nonces: Arc<NonceCoordinator>,
    tracker: Arc<LifecycleTracker>,
    store: Arc<dyn StateStore>,
    gas: GasEstimator,
    /// Reconcile before allocating when the ledger is older than this
    stale_after: Duration,
    broadcast_timeout: Duration,
}

impl SubmissionCoordinator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn TransactionSigner>,
        store: Arc<dyn StateStore>,
        gas: GasEstimator,
        config: &GatewayConfig,
    ) -> Self {
        let nonces = Arc::new(NonceCoordinator::new(chain.clone()));
        let tracker = Arc::new(LifecycleTracker::new(
            chain.clone(),
            gas.clone(),
            config.poll_timeout(),
            config.drop_after(),
        ));

        Self {
            chain,
            signer,
            nonces,
            tracker,
            store,
            gas,
            stale_after: config.nonce_stale_after(),
            broadcast_timeout: config.broadcast_timeout(),
        }
    }

    /// Sign and broadcast one transaction, returning its nonce and hash.
    ///
    /// Errors before the broadcast, and outright rejections, release the
    /// nonce. A transport failure or timeout during the broadcast returns a
    /// retryable error but keeps the nonce pending, with the transaction
    /// tracked under its local hash. The broadcast is never retried here.
    pub async fn submit(&self, request: SubmissionRequest) -> GatewayResult<Submission> {
        let account = request.account;

        if self.nonces.needs_reconcile(account, self.stale_after).await {
            self.nonces.reconcile(account).await?;
            if let Err(e) = self.store.record_account(account).await {
                warn!(?account, "Failed to persist account: {}", e);
            }
        }

        let nonce = match request.nonce {
            NonceSelection::Auto => self.nonces.allocate(account).await?,
            NonceSelection::Explicit(nonce) => {
                self.nonces.claim(account, nonce).await?;
                nonce
            }
        };
        let mut reservation = NonceReservation::new(self.nonces.clone(), account, nonce);

        let raw = match self.prepare(account, &request.payload, nonce).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(?account, nonce, "Submission failed before broadcast: {}", e);
                reservation.release().await;
                return Err(e);
            }
        };

        let mut submission = Submission {
            id: Uuid::new_v4(),
            account,
            nonce,
            tx_hash: H256::from(keccak256(&raw)),
        };
        reservation.sent(InFlight {
            tracker: self.tracker.clone(),
            store: self.store.clone(),
            record: TrackedTransaction::pending(&submission),
        });

        let tx_hash = match timeout(self.broadcast_timeout, self.chain.broadcast(raw)).await {
            Ok(Ok(tx_hash)) => tx_hash,
            Ok(Err(BroadcastError::Rejected(reason))) => {
                warn!(?account, nonce, %reason, "Broadcast rejected");
                reservation.release().await;
                crate::metrics::record_submission_rejected();
                return Err(GatewayError::SubmissionRejected {
                    account,
                    nonce,
                    reason,
                });
            }
            Ok(Err(BroadcastError::Unreachable(message))) => {
                warn!(?account, nonce, "Broadcast outcome unknown: {}", message);
                self.hold(reservation).await;
                return Err(GatewayError::network("broadcast", message));
            }
            Err(_) => {
                warn!(?account, nonce, "Broadcast timed out; outcome unknown");
                self.hold(reservation).await;
                return Err(GatewayError::Timeout {
                    operation: "broadcast".to_string(),
                });
            }
        };
        reservation.commit();

        if tx_hash != submission.tx_hash {
            warn!(local = ?submission.tx_hash, node = ?tx_hash, "Node reported a different hash");
            submission.tx_hash = tx_hash;
        }
        let record = TrackedTransaction::pending(&submission);
        self.tracker.record(record.clone())?;
        self.persist(&record).await;

        info!(?account, nonce, ?tx_hash, id = %submission.id, "Transaction submitted");
        crate::metrics::record_tx_submitted();
        Ok(submission)
    }

    /// Fetch a gas price and sign
    async fn prepare(
        &self,
        account: Address,
        payload: &UnsignedTransaction,
        nonce: u64,
    ) -> GatewayResult<Bytes> {
        let gas_price = self.gas.buffered(self.chain.gas_price().await?);
        self.signer.sign(account, payload, nonce, &gas_price).await
    }

    /// Keep an ambiguous broadcast's nonce pending and track it until the
    /// chain settles it or the node is seen to have dropped it
    async fn hold(&self, reservation: NonceReservation) {
        if let Some(in_flight) = reservation.hold() {
            if in_flight.track() {
                self.persist(&in_flight.record).await;
            }
        }
    }

    /// Poll one transaction's outcome.
    ///
    /// A transaction the node has dropped gives its nonce back.
    pub async fn poll_status(&self, tx_hash: H256) -> GatewayResult<StatusSnapshot> {
        let snapshot = self.tracker.poll(tx_hash).await?;

        if snapshot.changed {
            let tx = &snapshot.transaction;
            if tx.status == TransactionStatus::Dropped {
                release_and_invalidate(self.nonces.clone(), tx.account, tx.nonce).await;
            }
            self.persist(tx).await;
        }

        Ok(snapshot)
    }

    /// Known state of a transaction, without contacting the chain
    pub fn lookup(&self, tx_hash: H256) -> Option<TrackedTransaction> {
        self.tracker.lookup(tx_hash)
    }

    /// Next nonce for an account. Informational, not a reservation.
    pub async fn current_nonce(&self, account: Address) -> GatewayResult<u64> {
        self.nonces.current_nonce(account).await
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// Every persisted (and signer-held) account is reconciled, then tracked
    /// transactions are restored. Nonces of still-pending transactions are
    /// re-reserved so they are not handed out again.
    pub async fn recover(&self) -> GatewayResult<usize> {
        let mut accounts = self.store.known_accounts().await?;
        for account in self.signer.accounts() {
            if !accounts.contains(&account) {
                accounts.push(account);
            }
        }

        for account in &accounts {
            self.nonces.reconcile(*account).await?;
        }

        let transactions = self.store.load_transactions().await?;
        let restored = transactions.len();
        for tx in transactions {
            let live = !tx.status.is_terminal();
            let (account, nonce) = (tx.account, tx.nonce);
            self.tracker.restore(tx);

            if live {
                match self.nonces.claim(account, nonce).await {
                    Ok(()) => debug!(?account, nonce, "Re-reserved nonce of pending transaction"),
                    Err(GatewayError::NonceCollision { .. }) => {
                        debug!(?account, nonce, "Pending transaction already confirmed")
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            accounts = accounts.len(),
            transactions = restored,
            "Recovered submission state"
        );
        Ok(restored)
    }

    /// Reconcile every known account
    pub async fn reconcile_all(&self) {
        for account in self.nonces.known_accounts() {
            if let Err(e) = self.nonces.reconcile(account).await {
                warn!(?account, "Reconcile failed: {}", e);
            }
        }
    }

    /// Hashes still awaiting an outcome
    pub fn pending_hashes(&self) -> Vec<H256> {
        self.tracker.pending_hashes()
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    pub fn nonces(&self) -> &NonceCoordinator {
        &self.nonces
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.health_check().await.is_ok()
    }

    async fn persist(&self, tx: &TrackedTransaction) {
        if let Err(e) = self.store.save_transaction(tx).await {
            warn!(tx_hash = ?tx.tx_hash, "Failed to persist transaction: {}", e);
        }
    }
}
