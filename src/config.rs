//! Configuration management for the nonce gateway
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub instance_id: String,
    /// Ledgers older than this are reconciled before the next allocation
    pub nonce_stale_after_secs: u64,
    pub poll_timeout_ms: u64,
    pub broadcast_timeout_ms: u64,
    pub refresh_interval_ms: u64,
    /// Unknown-to-node transactions older than this are reported as dropped
    pub drop_after_secs: u64,
    pub retention_secs: u64,
    /// Gas usage share above which a reverted transaction counts as out of gas.
    /// Approximate: a revert can legitimately burn most of its gas.
    pub out_of_gas_threshold_percent: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: "gateway-0".to_string(),
            nonce_stale_after_secs: 30,
            poll_timeout_ms: 10_000,
            broadcast_timeout_ms: 30_000,
            refresh_interval_ms: 5_000,
            drop_after_secs: 600,
            retention_secs: 86_400,
            out_of_gas_threshold_percent: 90,
        }
    }
}

impl GatewayConfig {
    pub fn nonce_stale_after(&self) -> Duration {
        Duration::from_secs(self.nonce_stale_after_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn drop_after(&self) -> Duration {
        Duration::from_secs(self.drop_after_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_gas_price_buffer")]
    pub gas_price_buffer_percent: u64,
}

fn default_gas_price_buffer() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Env var holding one or more comma-separated private keys
    pub private_key_env: String,
}

impl Settings {
    /// Load settings from the file named by `GATEWAY_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("GATEWAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        let threshold = self.gateway.out_of_gas_threshold_percent;
        if threshold == 0 || threshold > 100 {
            anyhow::bail!(
                "out_of_gas_threshold_percent must be within 1..=100, got {}",
                threshold
            );
        }

        if self.gateway.poll_timeout_ms == 0 || self.gateway.broadcast_timeout_ms == 0 {
            anyhow::bail!("Chain call timeouts must be non-zero");
        }

        if self.wallet.private_key_env.is_empty() {
            anyhow::bail!("wallet.private_key_env must name an environment variable");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
