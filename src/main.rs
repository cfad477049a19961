//! Nonce Gateway - transaction submission with per-account nonce coordination
//!
//! Hands out nonces for the accounts it signs for, broadcasts signed
//! transactions and tracks each one until the chain reports an outcome.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod metrics;
mod state;
mod tx;

use chain::{ChainClient, ChainProvider};
use config::{LoggingConfig, Settings};
use metrics::MetricsServer;
use state::{MemoryStateStore, PgStateStore, StateStore};
use tx::{GasEstimator, LifecycleMonitor, SubmissionCoordinator, WalletSigner};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!(
        instance = %settings.gateway.instance_id,
        "Starting Nonce Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize state store
    let store: Arc<dyn StateStore> = match &settings.database {
        Some(database) => {
            let store = PgStateStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => {
            warn!("No database configured; state will not survive a restart");
            Arc::new(MemoryStateStore::default())
        }
    };

    // Initialize chain access
    let provider = ChainProvider::new(settings.chain.clone())?;
    match provider.get_block_number().await {
        Ok(block) => info!(
            chain_id = provider.chain_id(),
            block, "Connected to {}", settings.chain.name
        ),
        Err(e) => warn!("Chain not reachable at startup: {}", e),
    }
    let chain: Arc<dyn ChainClient> = Arc::new(provider);

    let signer = Arc::new(WalletSigner::from_env(
        settings.chain.chain_id,
        &settings.wallet.private_key_env,
    )?);

    let gas = GasEstimator::new(
        settings.chain.gas_price_buffer_percent,
        settings.gateway.out_of_gas_threshold_percent,
    );
    let coordinator = Arc::new(SubmissionCoordinator::new(
        chain.clone(),
        signer,
        store,
        gas,
        &settings.gateway,
    ));

    // Ledgers must match the chain before any nonce is handed out
    let restored = coordinator.recover().await?;
    info!(restored, "Submission coordinator initialized");

    let monitor = Arc::new(LifecycleMonitor::new(coordinator.clone(), &settings.gateway));

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let state = api::AppState {
            coordinator: coordinator.clone(),
            chain: chain.clone(),
            instance_id: settings.gateway.instance_id.clone(),
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(api_config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start lifecycle monitor
    let monitor_handle = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run().await }
    });

    info!("Nonce Gateway is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    monitor.stop().await;

    // Abort background tasks
    api_handle.abort();
    monitor_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Nonce Gateway stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,nonce_gateway=debug,sqlx=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
