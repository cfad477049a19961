//! Gas price buffering for signing and gas-based outcome classification

use super::types::TransactionStatus;
use crate::chain::{GasPrice, ReceiptSummary};

use ethers::types::U256;
use tracing::debug;

/// Gas policy applied around signing and receipt classification
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Share of the gas limit a reverted transaction must exceed to count as out of gas
    out_of_gas_threshold_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(gas_price_buffer_percent: u64, out_of_gas_threshold_percent: u64) -> Self {
        Self {
            gas_price_buffer_percent,
            out_of_gas_threshold_percent,
        }
    }

    /// Add the configured buffer to an oracle price
    pub fn buffered(&self, gas_price: GasPrice) -> GasPrice {
        let buffered = match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        };

        debug!("Buffered gas price: {:?}", buffered);
        buffered
    }

    /// Classify a mined receipt.
    ///
    /// A revert that burned strictly more than the threshold share of its gas
    /// limit is reported as out of gas. This is a heuristic: a revert late in
    /// execution can look the same.
    pub fn classify(&self, receipt: ReceiptSummary, gas_limit: U256) -> TransactionStatus {
        if receipt.success {
            return TransactionStatus::Confirmed(receipt);
        }

        if gas_limit.is_zero() {
            return TransactionStatus::Failed(receipt);
        }

        let used = receipt.gas_used.saturating_mul(U256::from(100));
        let threshold = gas_limit.saturating_mul(U256::from(self.out_of_gas_threshold_percent));
        if used > threshold {
            TransactionStatus::OutOfGas(receipt)
        } else {
            TransactionStatus::Failed(receipt)
        }
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new(10, 90)
    }
}
