//! Error types for the nonce gateway

use ethers::types::{Address, H256};
use thiserror::Error;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error during {operation}: {message}")]
    TransientNetwork { operation: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Nonce {nonce} for account {account:?} collides: {reason}")]
    NonceCollision {
        account: Address,
        nonce: u64,
        reason: String,
    },

    #[error("Submission rejected for account {account:?} (nonce {nonce}): {reason}")]
    SubmissionRejected {
        account: Address,
        nonce: u64,
        reason: String,
    },

    #[error("Signing failed for account {account:?}: {message}")]
    Signing { account: Address, message: String },

    #[error("Transaction {tx_hash:?} not found")]
    TransactionNotFound { tx_hash: H256 },

    #[error("Account {account:?} has no nonce ledger")]
    AccountNotFound { account: Address },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a failed chain round trip
    pub fn network(operation: impl Into<String>, message: impl ToString) -> Self {
        GatewayError::TransientNetwork {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientNetwork { .. } | GatewayError::Timeout { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            GatewayError::InvariantViolation(_) | GatewayError::Database(_)
        )
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_kinds_are_retryable() {
        assert!(GatewayError::network("receipt", "connection reset").is_retryable());
        assert!(GatewayError::Timeout {
            operation: "poll".to_string()
        }
        .is_retryable());

        let rejected = GatewayError::SubmissionRejected {
            account: Address::zero(),
            nonce: 3,
            reason: "insufficient funds".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!GatewayError::InvariantViolation("dup".into()).is_retryable());
    }

    #[test]
    fn test_invariant_violation_alerts() {
        assert!(GatewayError::InvariantViolation("dup".into()).should_alert());
        assert!(!GatewayError::network("count", "eof").should_alert());
    }
}
