//! HTTP API for health checks, status, approvals, and transaction lookups

use crate::chain::ChainClient;
use crate::config::ApiConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::tx::{
    LedgerSnapshot, Submission, SubmissionCoordinator, SubmissionRequest, UnsignedTransaction,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Gas limit for approvals when the caller gives none
const APPROVE_GAS_LIMIT: u64 = 100_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SubmissionCoordinator>,
    pub chain: Arc<dyn ChainClient>,
    pub instance_id: String,
    pub started_at: Instant,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/nonce/:address", get(get_nonce))
        .route("/approve", post(approve))
        .route("/poll/:tx_hash", get(poll_transaction))
        .route("/transactions/:tx_hash", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> GatewayResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| GatewayError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify store and chain
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.coordinator.store_healthy().await;
    let chain = state.chain.health_check().await;
    let ready = store && chain;

    if ready {
        crate::metrics::record_health_check();
    } else {
        crate::metrics::record_health_check_failure();
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store,
            chain,
        }),
    )
}

/// Gateway status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let nonces = state.coordinator.nonces();
    let mut accounts = Vec::new();
    for account in nonces.known_accounts() {
        if let Some(snapshot) = nonces.snapshot(account).await {
            accounts.push(snapshot);
        }
    }
    accounts.sort_by_key(|s| s.account);

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.instance_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        transactions: state.coordinator.tracker().stats(),
        accounts,
    })
}

/// Next nonce for an account (informational)
async fn get_nonce(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<NonceResponse>, ApiError> {
    let account = address
        .parse::<Address>()
        .map_err(|_| ApiError::bad_request(format!("invalid address: {}", address)))?;
    let nonce = state.coordinator.current_nonce(account).await?;
    Ok(Json(NonceResponse { account, nonce }))
}

/// Sign and broadcast an ERC-20 approval from a signer-held account
async fn approve(
    State(state): State<AppState>,
    Json(body): Json<ApprovalRequest>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let amount = body.amount.as_deref().map(parse_amount).transpose()?;
    let gas_limit = U256::from(body.gas_limit.unwrap_or(APPROVE_GAS_LIMIT));
    let payload = UnsignedTransaction::erc20_approve(body.token, body.spender, amount, gas_limit);

    let mut request = SubmissionRequest::new(body.address, payload);
    if let Some(nonce) = body.nonce {
        request = request.with_nonce(nonce);
    }

    let submission = state.coordinator.submit(request).await?;
    Ok(Json(ApprovalResponse {
        submission,
        token: body.token,
        spender: body.spender,
        amount: amount.unwrap_or(U256::MAX),
    }))
}

/// Poll the chain once for a tracked transaction
async fn poll_transaction(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Response, ApiError> {
    let tx_hash = parse_hash(&tx_hash)?;
    let snapshot = state.coordinator.poll_status(tx_hash).await?;
    Ok(Json(snapshot).into_response())
}

/// Known state of a tracked transaction, without a chain call
async fn get_transaction(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Response, ApiError> {
    let tx_hash = parse_hash(&tx_hash)?;
    let tx = state
        .coordinator
        .lookup(tx_hash)
        .ok_or(GatewayError::TransactionNotFound { tx_hash })?;
    Ok(Json(tx).into_response())
}

fn parse_hash(raw: &str) -> Result<H256, ApiError> {
    raw.parse::<H256>()
        .map_err(|_| ApiError::bad_request(format!("invalid transaction hash: {}", raw)))
}

/// Decimal, or hex with a `0x` prefix
fn parse_amount(raw: &str) -> Result<U256, ApiError> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(raw).ok(),
    };
    parsed.ok_or_else(|| ApiError::bad_request(format!("invalid amount: {}", raw)))
}

/// Error body returned by every endpoint
struct ApiError {
    status: StatusCode,
    message: String,
    retryable: bool,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
            retryable: false,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::TransactionNotFound { .. } | GatewayError::AccountNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::TransientNetwork { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::NonceCollision { .. } => StatusCode::CONFLICT,
            GatewayError::SubmissionRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Signing { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                retryable: self.retryable,
            }),
        )
            .into_response()
    }
}

// Request types

#[derive(Deserialize)]
struct ApprovalRequest {
    /// Signing account
    address: Address,
    token: Address,
    spender: Address,
    /// Unlimited when absent
    amount: Option<String>,
    /// Caller-managed nonce, used as-is
    nonce: Option<u64>,
    gas_limit: Option<u64>,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chain: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    instance_id: String,
    uptime_seconds: u64,
    transactions: BTreeMap<&'static str, usize>,
    accounts: Vec<LedgerSnapshot>,
}

#[derive(Serialize)]
struct ApprovalResponse {
    #[serde(flatten)]
    submission: Submission,
    token: Address,
    spender: Address,
    amount: U256,
}

#[derive(Serialize)]
struct NonceResponse {
    account: Address,
    nonce: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    retryable: bool,
}
