//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Per-account serialized allocation (no two transactions share a nonce)
//! - Release of never-broadcast nonces and refilling of the resulting holes
//! - Monotonic reconciliation against the chain's confirmed transaction count
//!
//! Each account owns one ledger behind its own async mutex. Ledgers are
//! created on first use and kept for the process lifetime, so unrelated
//! accounts never contend. Chain reads happen with no ledger lock held.

use crate::chain::ChainClient;
use crate::error::{GatewayError, GatewayResult};

use dashmap::DashMap;
use ethers::types::Address;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-account nonce state
#[derive(Debug, Default)]
struct NonceLedger {
    /// Next never-handed-out nonce
    next_nonce: u64,
    /// Handed out and not yet seen confirmed (or released)
    pending: BTreeSet<u64>,
    /// `None` until the first reconciliation, or after `invalidate`
    last_reconciled_at: Option<Instant>,
    /// Confirmed transaction count observed at the last reconciliation
    last_reconciled_chain_count: u64,
    /// Set once the ledger has been seeded from the chain
    seeded: bool,
}

impl NonceLedger {
    /// Lowest released nonce that is neither confirmed nor pending
    fn lowest_hole(&self) -> Option<u64> {
        (self.last_reconciled_chain_count..self.next_nonce).find(|n| !self.pending.contains(n))
    }

    /// Pull `next_nonce` back over trailing released values
    fn roll_back(&mut self) {
        while self.next_nonce > self.last_reconciled_chain_count
            && !self.pending.contains(&(self.next_nonce - 1))
        {
            self.next_nonce -= 1;
        }
    }

    /// Fold an observed chain count into the ledger. Returns the number of
    /// pending entries cleared.
    fn apply_chain_count(&mut self, chain_count: u64) -> usize {
        self.last_reconciled_at = Some(Instant::now());

        if !self.seeded {
            self.seeded = true;
            self.next_nonce = self.next_nonce.max(chain_count);
        }

        if chain_count <= self.last_reconciled_chain_count {
            return 0;
        }
        self.last_reconciled_chain_count = chain_count;

        if chain_count > self.next_nonce {
            self.next_nonce = chain_count;
        }

        let before = self.pending.len();
        self.pending = self.pending.split_off(&chain_count);
        before - self.pending.len()
    }
}

/// Point-in-time view of a ledger, for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub account: Address,
    pub next_nonce: u64,
    pub pending: Vec<u64>,
    pub last_reconciled_chain_count: u64,
    pub reconciled_secs_ago: Option<u64>,
}

/// Single authority for "the next nonce" of every account
pub struct NonceCoordinator {
    chain: Arc<dyn ChainClient>,
    ledgers: DashMap<Address, Arc<Mutex<NonceLedger>>>,
}

impl NonceCoordinator {
    /// Create a new nonce coordinator
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            ledgers: DashMap::new(),
        }
    }

    /// Ledger for an account, created empty on first access
    fn ledger(&self, account: Address) -> Arc<Mutex<NonceLedger>> {
        self.ledgers
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(NonceLedger::default())))
            .clone()
    }

    /// Ledger for an account that must already exist
    fn existing_ledger(&self, account: Address) -> GatewayResult<Arc<Mutex<NonceLedger>>> {
        self.ledgers
            .get(&account)
            .map(|l| l.clone())
            .ok_or(GatewayError::AccountNotFound { account })
    }

    /// Hand out the next nonce for `account` and mark it pending.
    ///
    /// Released holes are refilled lowest-first before `next_nonce` grows.
    /// An unseen account is reconciled first.
    pub async fn allocate(&self, account: Address) -> GatewayResult<u64> {
        let ledger = self.ledger(account);

        loop {
            {
                let mut state = ledger.lock().await;
                if state.seeded {
                    let nonce = match state.lowest_hole() {
                        Some(hole) => hole,
                        None => {
                            let nonce = state.next_nonce;
                            state.next_nonce += 1;
                            nonce
                        }
                    };
                    state.pending.insert(nonce);

                    debug!(?account, nonce, next = state.next_nonce, "Allocated nonce");
                    crate::metrics::record_nonce_allocated(account, state.pending.len());
                    return Ok(nonce);
                }
            }

            self.reconcile(account).await?;
        }
    }

    /// Reserve a caller-chosen nonce.
    ///
    /// Fails with `NonceCollision` if the value is already pending or below
    /// the confirmed count. Nothing is mutated on failure.
    pub async fn claim(&self, account: Address, nonce: u64) -> GatewayResult<()> {
        let ledger = self.ledger(account);

        loop {
            {
                let mut state = ledger.lock().await;
                if state.seeded {
                    if nonce < state.last_reconciled_chain_count {
                        crate::metrics::record_nonce_collision();
                        return Err(GatewayError::NonceCollision {
                            account,
                            nonce,
                            reason: format!(
                                "already confirmed (chain count {})",
                                state.last_reconciled_chain_count
                            ),
                        });
                    }
                    if state.pending.contains(&nonce) {
                        crate::metrics::record_nonce_collision();
                        return Err(GatewayError::NonceCollision {
                            account,
                            nonce,
                            reason: "already pending".to_string(),
                        });
                    }

                    state.pending.insert(nonce);
                    if nonce >= state.next_nonce {
                        state.next_nonce = nonce + 1;
                    }

                    debug!(?account, nonce, next = state.next_nonce, "Claimed explicit nonce");
                    crate::metrics::record_nonce_allocated(account, state.pending.len());
                    return Ok(());
                }
            }

            self.reconcile(account).await?;
        }
    }

    /// Return a nonce that was never broadcast.
    ///
    /// If it was the highest outstanding value `next_nonce` rolls back so the
    /// value is reused directly; otherwise it becomes a hole that the next
    /// `allocate` fills.
    pub async fn release(&self, account: Address, nonce: u64) -> GatewayResult<()> {
        let ledger = self.existing_ledger(account)?;
        let mut state = ledger.lock().await;

        if !state.pending.remove(&nonce) {
            // Already cleared by reconciliation, or released twice
            debug!(?account, nonce, "Release of non-pending nonce ignored");
            return Ok(());
        }

        state.roll_back();

        debug!(?account, nonce, next = state.next_nonce, "Released nonce");
        crate::metrics::record_nonce_released(account, state.pending.len());
        Ok(())
    }

    /// Sync the ledger with the chain's confirmed transaction count.
    ///
    /// Only ever moves state forward: a lower observed count (stale node,
    /// slow read racing local allocations) changes nothing but the timestamp.
    pub async fn reconcile(&self, account: Address) -> GatewayResult<u64> {
        let chain_count = self.chain.transaction_count(account).await?;

        let ledger = self.ledger(account);
        let mut state = ledger.lock().await;
        let was_seeded = state.seeded;
        let previous_next = state.next_nonce;
        let cleared = state.apply_chain_count(chain_count);

        if !was_seeded {
            info!(?account, chain_count, "Seeded nonce ledger from chain");
        } else if state.next_nonce > previous_next {
            warn!(
                ?account,
                chain_count,
                previous_next,
                cleared,
                "Chain is ahead of local nonce; external transactions detected"
            );
        } else if cleared > 0 {
            debug!(?account, chain_count, cleared, "Cleared confirmed nonces");
        }

        crate::metrics::record_nonce_reconciled(account, state.pending.len());
        Ok(state.next_nonce)
    }

    /// Whether the account is unseen, invalidated, or reconciled longer ago than `max_age`
    pub async fn needs_reconcile(&self, account: Address, max_age: Duration) -> bool {
        let Some(ledger) = self.ledgers.get(&account).map(|l| l.clone()) else {
            return true;
        };
        let state = ledger.lock().await;
        match state.last_reconciled_at {
            Some(at) => at.elapsed() > max_age,
            None => true,
        }
    }

    /// Force a reconcile before the next submission for `account`
    pub async fn invalidate(&self, account: Address) {
        if let Some(ledger) = self.ledgers.get(&account).map(|l| l.clone()) {
            ledger.lock().await.last_reconciled_at = None;
            info!(?account, "Nonce ledger invalidated");
        }
    }

    /// Next nonce the coordinator would hand out. Informational only.
    ///
    /// Accounts without a seeded ledger are answered from the chain without
    /// creating one.
    pub async fn current_nonce(&self, account: Address) -> GatewayResult<u64> {
        if let Some(ledger) = self.ledgers.get(&account).map(|l| l.clone()) {
            let state = ledger.lock().await;
            if state.seeded {
                return Ok(state.lowest_hole().unwrap_or(state.next_nonce));
            }
        }
        self.chain.transaction_count(account).await
    }

    /// Pending nonces for an account, ascending
    pub async fn pending(&self, account: Address) -> Vec<u64> {
        match self.ledgers.get(&account).map(|l| l.clone()) {
            Some(ledger) => ledger.lock().await.pending.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn snapshot(&self, account: Address) -> Option<LedgerSnapshot> {
        let ledger = self.ledgers.get(&account).map(|l| l.clone())?;
        let state = ledger.lock().await;
        Some(LedgerSnapshot {
            account,
            next_nonce: state.next_nonce,
            pending: state.pending.iter().copied().collect(),
            last_reconciled_chain_count: state.last_reconciled_chain_count,
            reconciled_secs_ago: state.last_reconciled_at.map(|at| at.elapsed().as_secs()),
        })
    }

    /// Every account this process has a ledger for
    pub fn known_accounts(&self) -> Vec<Address> {
        self.ledgers.iter().map(|e| *e.key()).collect()
    }
}
