//! Transaction submission: nonce coordination, signing, broadcast and lifecycle tracking

mod gas;
mod monitor;
mod nonce;
mod sender;
mod signer;
mod tracker;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use gas::GasEstimator;
pub use monitor::LifecycleMonitor;
pub use nonce::LedgerSnapshot;
pub use sender::SubmissionCoordinator;
pub use signer::WalletSigner;
pub use types::{
    Submission, SubmissionRequest, TrackedTransaction, TransactionStatus, UnsignedTransaction,
};
