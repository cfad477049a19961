//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation, release and reconciliation per account
//! - Submission and lifecycle outcomes
//! - Poll errors and invariant violations
//! - Health checks

use crate::error::{GatewayError, GatewayResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::Address;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Nonce metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "gateway_nonces_allocated_total",
        "Total nonces handed out",
        &["account"]
    ).unwrap();

    pub static ref NONCES_RELEASED: CounterVec = register_counter_vec!(
        "gateway_nonces_released_total",
        "Total nonces returned unused",
        &["account"]
    ).unwrap();

    pub static ref NONCE_RECONCILIATIONS: CounterVec = register_counter_vec!(
        "gateway_nonce_reconciliations_total",
        "Total ledger reconciliations against the chain",
        &["account"]
    ).unwrap();

    pub static ref NONCE_COLLISIONS: CounterVec = register_counter_vec!(
        "gateway_nonce_collisions_total",
        "Total caller-supplied nonces refused",
        &[]
    ).unwrap();

    pub static ref PENDING_NONCES: GaugeVec = register_gauge_vec!(
        "gateway_pending_nonces",
        "Nonces handed out and not yet confirmed",
        &["account"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "gateway_transactions_submitted_total",
        "Total transactions accepted by the node",
        &[]
    ).unwrap();

    pub static ref TX_REJECTED: CounterVec = register_counter_vec!(
        "gateway_transactions_rejected_total",
        "Total transactions refused by the node",
        &[]
    ).unwrap();

    pub static ref TX_OUTCOMES: CounterVec = register_counter_vec!(
        "gateway_transaction_outcomes_total",
        "Terminal transaction statuses observed",
        &["status"]
    ).unwrap();

    pub static ref PENDING_TRANSACTIONS: GaugeVec = register_gauge_vec!(
        "gateway_pending_transactions",
        "Tracked transactions awaiting an outcome",
        &[]
    ).unwrap();

    pub static ref POLL_ERRORS: CounterVec = register_counter_vec!(
        "gateway_poll_errors_total",
        "Total status polls that failed or timed out",
        &[]
    ).unwrap();

    pub static ref INVARIANT_VIOLATIONS: CounterVec = register_counter_vec!(
        "gateway_invariant_violations_total",
        "Total detected internal invariant violations",
        &[]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "gateway_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "gateway_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> GatewayResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| GatewayError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Encode every registered metric in the text exposition format
pub fn render() -> GatewayResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| GatewayError::Internal(e.to_string()))
}

// Helper functions to record metrics

fn account_label(account: Address) -> String {
    format!("{:?}", account)
}

pub fn record_nonce_allocated(account: Address, pending: usize) {
    let label = account_label(account);
    NONCES_ALLOCATED.with_label_values(&[&label]).inc();
    PENDING_NONCES.with_label_values(&[&label]).set(pending as f64);
}

pub fn record_nonce_released(account: Address, pending: usize) {
    let label = account_label(account);
    NONCES_RELEASED.with_label_values(&[&label]).inc();
    PENDING_NONCES.with_label_values(&[&label]).set(pending as f64);
}

pub fn record_nonce_reconciled(account: Address, pending: usize) {
    let label = account_label(account);
    NONCE_RECONCILIATIONS.with_label_values(&[&label]).inc();
    PENDING_NONCES.with_label_values(&[&label]).set(pending as f64);
}

pub fn record_nonce_collision() {
    NONCE_COLLISIONS.with_label_values(&[]).inc();
}

pub fn record_tx_submitted() {
    TX_SUBMITTED.with_label_values(&[]).inc();
}

pub fn record_submission_rejected() {
    TX_REJECTED.with_label_values(&[]).inc();
}

pub fn record_tx_outcome(status: &str) {
    TX_OUTCOMES.with_label_values(&[status]).inc();
}

pub fn set_pending_transactions(count: usize) {
    PENDING_TRANSACTIONS.with_label_values(&[]).set(count as f64);
}

pub fn record_poll_error() {
    POLL_ERRORS.with_label_values(&[]).inc();
}

pub fn record_invariant_violation() {
    INVARIANT_VIOLATIONS.with_label_values(&[]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
