//! Transaction signing with locally held keys

use super::gas::GasEstimator;
use super::types::UnsignedTransaction;
use crate::chain::GasPrice;
use crate::error::{GatewayError, GatewayResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use tracing::{debug, info};

/// Turns an unsigned payload plus nonce into broadcastable bytes
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Accounts this signer holds keys for
    fn accounts(&self) -> Vec<Address>;

    /// Sign and RLP-encode a transaction for `account`
    async fn sign(
        &self,
        account: Address,
        payload: &UnsignedTransaction,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> GatewayResult<Bytes>;
}

/// Signer backed by in-process private keys
pub struct WalletSigner {
    chain_id: u64,
    wallets: HashMap<Address, LocalWallet>,
}

impl WalletSigner {
    pub fn new(chain_id: u64, wallets: Vec<LocalWallet>) -> Self {
        let wallets = wallets
            .into_iter()
            .map(|w| {
                let w = w.with_chain_id(chain_id);
                (w.address(), w)
            })
            .collect();
        Self { chain_id, wallets }
    }

    /// Load comma-separated private keys from the named environment variable
    pub fn from_env(chain_id: u64, var: &str) -> GatewayResult<Self> {
        let keys = std::env::var(var).map_err(|_| {
            GatewayError::Config(format!("No wallet configured. Set {}", var))
        })?;
        let signer = Self::from_keys(chain_id, &keys)?;
        info!(
            accounts = signer.wallets.len(),
            "Wallet signer initialized from {}", var
        );
        Ok(signer)
    }

    fn from_keys(chain_id: u64, keys: &str) -> GatewayResult<Self> {
        let wallets = keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| {
                k.parse::<LocalWallet>()
                    .map_err(|e| GatewayError::Config(format!("Invalid private key: {}", e)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        if wallets.is_empty() {
            return Err(GatewayError::Config("No private keys provided".to_string()));
        }
        Ok(Self::new(chain_id, wallets))
    }

    /// Build the typed transaction for a payload
    fn build(
        &self,
        account: Address,
        payload: &UnsignedTransaction,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => {
                let tx = TransactionRequest::new()
                    .from(account)
                    .to(payload.to)
                    .data(payload.data.clone())
                    .value(payload.value)
                    .nonce(nonce)
                    .gas(payload.gas_limit)
                    .gas_price(*price)
                    .chain_id(self.chain_id);
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let tx = Eip1559TransactionRequest::new()
                    .from(account)
                    .to(payload.to)
                    .data(payload.data.clone())
                    .value(payload.value)
                    .nonce(nonce)
                    .gas(payload.gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(self.chain_id);
                TypedTransaction::Eip1559(tx)
            }
        }
    }
}

#[async_trait]
impl TransactionSigner for WalletSigner {
    fn accounts(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }

    async fn sign(
        &self,
        account: Address,
        payload: &UnsignedTransaction,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> GatewayResult<Bytes> {
        let wallet = self.wallets.get(&account).ok_or_else(|| GatewayError::Signing {
            account,
            message: "no key held for account".to_string(),
        })?;

        let tx = self.build(account, payload, nonce, gas_price);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| GatewayError::Signing {
                account,
                message: e.to_string(),
            })?;

        debug!(
            ?account,
            nonce,
            max_cost = %GasEstimator::calculate_cost(payload.gas_limit, gas_price),
            "Signed transaction"
        );
        Ok(tx.rlp_signed(&signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn payload() -> UnsignedTransaction {
        UnsignedTransaction {
            to: Address::repeat_byte(0x42),
            data: Bytes::from(vec![0x01, 0x02]),
            value: U256::zero(),
            gas_limit: U256::from(60_000),
        }
    }

    #[test]
    fn test_loads_comma_separated_keys() {
        let second = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
        let signer = WalletSigner::from_keys(1, &format!("{}, {}", KEY, second)).unwrap();
        assert_eq!(signer.accounts().len(), 2);
        assert!(signer.accounts().contains(&KEY_ADDRESS.parse().unwrap()));

        assert!(WalletSigner::from_keys(1, " , ").is_err());
        assert!(WalletSigner::from_keys(1, "0xnothex").is_err());
    }

    #[tokio::test]
    async fn test_signature_recovers_to_account() {
        let signer = WalletSigner::from_keys(1, KEY).unwrap();
        let account: Address = KEY_ADDRESS.parse().unwrap();
        let gas_price = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(30_000_000_000u64),
            max_priority_fee_per_gas: U256::from(2_000_000_000u64),
        };

        let tx = signer.build(account, &payload(), 7, &gas_price);
        assert_eq!(tx.nonce(), Some(&U256::from(7)));
        assert_eq!(tx.gas(), Some(&U256::from(60_000)));

        let wallet = signer.wallets.get(&account).unwrap();
        let signature = wallet.sign_transaction(&tx).await.unwrap();
        assert_eq!(signature.recover(tx.sighash()).unwrap(), account);

        let raw = signer.sign(account, &payload(), 7, &gas_price).await.unwrap();
        assert!(!raw.is_empty());
        let other = signer.sign(account, &payload(), 8, &gas_price).await.unwrap();
        assert_ne!(raw, other);
    }

    #[tokio::test]
    async fn test_unknown_account_is_signing_error() {
        let signer = WalletSigner::from_keys(1, KEY).unwrap();
        let err = signer
            .sign(
                Address::repeat_byte(0x01),
                &payload(),
                0,
                &GasPrice::Legacy(U256::one()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Signing { .. }));
        assert!(!err.is_retryable());
    }
}
