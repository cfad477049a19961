//! PostgreSQL state store

use super::StateStore;
use crate::chain::ReceiptSummary;
use crate::config::DatabaseConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::tx::{TrackedTransaction, TransactionStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// State store for PostgreSQL persistence
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Create a new state store
    pub async fn new(config: &DatabaseConfig) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> GatewayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gateway_accounts (
                account VARCHAR(42) PRIMARY KEY,
                first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_transactions (
                tx_hash VARCHAR(66) PRIMARY KEY,
                submission_id UUID NOT NULL,
                account VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                receipt JSONB,
                submitted_at TIMESTAMPTZ NOT NULL,
                last_polled_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tracked_account_nonce
            ON tracked_transactions (account, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn record_account(&self, account: Address) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gateway_accounts (account)
            VALUES ($1)
            ON CONFLICT (account) DO NOTHING
            "#,
        )
        .bind(format!("{:?}", account))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn known_accounts(&self) -> GatewayResult<Vec<Address>> {
        let rows = sqlx::query("SELECT account FROM gateway_accounts")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| parse_address(&row.get::<String, _>("account")))
            .collect()
    }

    async fn save_transaction(&self, tx: &TrackedTransaction) -> GatewayResult<()> {
        let receipt = tx
            .status
            .receipt()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tracked_transactions
                (tx_hash, submission_id, account, nonce, status, receipt, submitted_at, last_polled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tx_hash)
            DO UPDATE SET status = $5, receipt = $6, last_polled_at = $8, updated_at = NOW()
            "#,
        )
        .bind(format!("{:?}", tx.tx_hash))
        .bind(tx.submission_id)
        .bind(format!("{:?}", tx.account))
        .bind(tx.nonce as i64)
        .bind(tx.status.label())
        .bind(receipt)
        .bind(tx.submitted_at)
        .bind(tx.last_polled_at)
        .execute(&self.pool)
        .await?;

        debug!(tx_hash = ?tx.tx_hash, status = tx.status.label(), "Saved transaction");
        Ok(())
    }

    async fn load_transactions(&self) -> GatewayResult<Vec<TrackedTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, submission_id, account, nonce, status, receipt,
                   submitted_at, last_polled_at
            FROM tracked_transactions
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    /// Health check
    async fn health_check(&self) -> GatewayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn transaction_from_row(row: &PgRow) -> GatewayResult<TrackedTransaction> {
    let tx_hash: String = row.get("tx_hash");
    let status: String = row.get("status");
    let receipt: Option<serde_json::Value> = row.get("receipt");
    let receipt = receipt
        .map(serde_json::from_value::<ReceiptSummary>)
        .transpose()
        .map_err(|e| GatewayError::Internal(format!("Corrupt receipt for {}: {}", tx_hash, e)))?;

    Ok(TrackedTransaction {
        submission_id: row.get::<Uuid, _>("submission_id"),
        tx_hash: tx_hash
            .parse::<H256>()
            .map_err(|e| GatewayError::Internal(format!("Invalid tx hash {}: {}", tx_hash, e)))?,
        account: parse_address(&row.get::<String, _>("account"))?,
        nonce: row.get::<i64, _>("nonce") as u64,
        submitted_at: row.get::<DateTime<Utc>, _>("submitted_at"),
        status: status_from_parts(&status, receipt)?,
        last_polled_at: row.get::<Option<DateTime<Utc>>, _>("last_polled_at"),
    })
}

fn parse_address(raw: &str) -> GatewayResult<Address> {
    raw.parse::<Address>()
        .map_err(|e| GatewayError::Internal(format!("Invalid address {}: {}", raw, e)))
}

/// Rebuild a status from its stored label and receipt
fn status_from_parts(
    label: &str,
    receipt: Option<ReceiptSummary>,
) -> GatewayResult<TransactionStatus> {
    let status = match (label, receipt) {
        ("pending", _) => TransactionStatus::Pending,
        ("dropped", _) => TransactionStatus::Dropped,
        ("confirmed", Some(r)) => TransactionStatus::Confirmed(r),
        ("failed", Some(r)) => TransactionStatus::Failed(r),
        ("out_of_gas", Some(r)) => TransactionStatus::OutOfGas(r),
        (other, _) => {
            return Err(GatewayError::Internal(format!(
                "Unreadable stored status: {}",
                other
            )))
        }
    };
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn receipt() -> ReceiptSummary {
        ReceiptSummary {
            block_number: Some(12),
            gas_used: U256::from(95_000),
            success: false,
            effective_gas_price: Some(U256::from(7)),
        }
    }

    #[test]
    fn test_status_labels_map_back() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Dropped,
            TransactionStatus::Confirmed(receipt()),
            TransactionStatus::Failed(receipt()),
            TransactionStatus::OutOfGas(receipt()),
        ] {
            let stored = status.receipt().cloned();
            assert_eq!(status_from_parts(status.label(), stored).unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_label_without_receipt_is_rejected() {
        assert!(status_from_parts("confirmed", None).is_err());
        assert!(status_from_parts("finalized", None).is_err());
    }

    #[test]
    fn test_receipt_json_round_trips() {
        let json = serde_json::to_value(receipt()).unwrap();
        assert_eq!(
            serde_json::from_value::<ReceiptSummary>(json).unwrap(),
            receipt()
        );
    }

    #[test]
    fn test_debug_formatted_keys_parse_back() {
        let account = Address::repeat_byte(0xab);
        assert_eq!(parse_address(&format!("{:?}", account)).unwrap(), account);
        assert!(parse_address("0x1234").is_err());
    }
}
