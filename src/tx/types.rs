//! Types shared by the nonce coordinator, lifecycle tracker and submission coordinator

use crate::chain::ReceiptSummary;

use chrono::{DateTime, Utc};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use uuid::Uuid;

/// ERC-20 `approve(address,uint256)` selector
const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

/// Transaction body before a nonce and gas price are attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: U256,
}

impl UnsignedTransaction {
    /// Approve `spender` to move `token` on the sender's behalf.
    /// `None` grants an unlimited allowance.
    pub fn erc20_approve(
        token: Address,
        spender: Address,
        amount: Option<U256>,
        gas_limit: U256,
    ) -> Self {
        let amount = amount.unwrap_or(U256::MAX);
        let mut data = APPROVE_SELECTOR.to_vec();
        data.extend(encode(&[Token::Address(spender), Token::Uint(amount)]));

        Self {
            to: token,
            data: data.into(),
            value: U256::zero(),
            gas_limit,
        }
    }
}

/// How the nonce for a submission is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSelection {
    /// Next nonce from the coordinator
    Auto,
    /// Caller-managed sequencing; checked for collisions and used as-is
    Explicit(u64),
}

/// A request to sign and broadcast one transaction
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub account: Address,
    pub payload: UnsignedTransaction,
    pub nonce: NonceSelection,
}

impl SubmissionRequest {
    pub fn new(account: Address, payload: UnsignedTransaction) -> Self {
        Self {
            account,
            payload,
            nonce: NonceSelection::Auto,
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = NonceSelection::Explicit(nonce);
        self
    }
}

/// Result of a successful broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub id: Uuid,
    pub account: Address,
    pub nonce: u64,
    pub tx_hash: H256,
}

/// Lifecycle state of a broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "receipt", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Confirmed(ReceiptSummary),
    /// Reverted for a reason other than gas exhaustion
    Failed(ReceiptSummary),
    /// Reverted after burning most of its gas limit
    OutOfGas(ReceiptSummary),
    /// The node no longer knows the transaction
    Dropped,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    pub fn receipt(&self) -> Option<&ReceiptSummary> {
        match self {
            TransactionStatus::Confirmed(r)
            | TransactionStatus::Failed(r)
            | TransactionStatus::OutOfGas(r) => Some(r),
            TransactionStatus::Pending | TransactionStatus::Dropped => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed(_) => "confirmed",
            TransactionStatus::Failed(_) => "failed",
            TransactionStatus::OutOfGas(_) => "out_of_gas",
            TransactionStatus::Dropped => "dropped",
        }
    }
}

/// A transaction this process has broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTransaction {
    pub submission_id: Uuid,
    pub tx_hash: H256,
    pub account: Address,
    pub nonce: u64,
    pub submitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: TransactionStatus,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl TrackedTransaction {
    /// Fresh record for a just-broadcast transaction
    pub fn pending(submission: &Submission) -> Self {
        Self {
            submission_id: submission.id,
            tx_hash: submission.tx_hash,
            account: submission.account,
            nonce: submission.nonce,
            submitted_at: Utc::now(),
            status: TransactionStatus::Pending,
            last_polled_at: None,
        }
    }
}
