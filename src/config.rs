//! Configuration management for the withdrawal service
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tx::FeeStrategy;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub gas: GasConfig,
    pub wallet: WalletConfig,
    /// Sending accounts kept in sync even before their first withdrawal
    #[serde(default)]
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_lock_sweep_interval_secs")]
    pub lock_sweep_interval_secs: u64,
    #[serde(default = "default_nonce_sync_interval_secs")]
    pub nonce_sync_interval_secs: u64,
    pub health_check_interval_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Empty URL keeps nonce records in process memory
    #[serde(default)]
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

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub fee_model: FeeModel,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
    #[serde(default = "default_native_decimals")]
    pub native_decimals: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeeModel {
    /// Fee market when the latest block carries a base fee, legacy otherwise
    #[default]
    Auto,
    Legacy,
    Eip1559,
}

/// Per-strategy value table
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct StrategyTable<T> {
    pub slow: T,
    pub standard: T,
    pub fast: T,
}

impl<T: Copy> StrategyTable<T> {
    pub fn get(&self, strategy: FeeStrategy) -> T {
        match strategy {
            FeeStrategy::Slow => self.slow,
            FeeStrategy::Standard => self.standard,
            FeeStrategy::Fast => self.fast,
        }
    }
}

impl<T: PartialOrd> StrategyTable<T> {
    fn is_ordered(&self) -> bool {
        self.slow <= self.standard && self.standard <= self.fast
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Intrinsic cost of a plain value transfer
    pub native_transfer_gas: u64,
    /// Used when simulating a token transfer fails
    pub token_transfer_fallback_gas: u64,
    pub gas_limit_buffer_percent: u64,
    pub priority_fee_gwei: StrategyTable<u64>,
    pub legacy_multiplier_percent: StrategyTable<u64>,
    pub fallback_base_fee_gwei: u64,
    pub fallback_gas_price_gwei: u64,
    pub fee_cache_ttl_secs: u64,
    /// Upper bound on each fee or simulation query before falling back
    pub query_timeout_secs: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            native_transfer_gas: 21_000,
            token_transfer_fallback_gas: 100_000,
            gas_limit_buffer_percent: 20,
            priority_fee_gwei: StrategyTable {
                slow: 1,
                standard: 2,
                fast: 3,
            },
            legacy_multiplier_percent: StrategyTable {
                slow: 90,
                standard: 100,
                fast: 125,
            },
            fallback_base_fee_gwei: 30,
            fallback_gas_price_gwei: 50,
            fee_cache_ttl_secs: 120,
            query_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hot wallet key
    pub private_key_env: Option<String>,
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_lock_retry_attempts() -> u32 {
    10
}

fn default_lock_retry_delay_ms() -> u64 {
    500
}

fn default_lock_sweep_interval_secs() -> u64 {
    15
}

fn default_nonce_sync_interval_secs() -> u64 {
    60
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_max_send_retries() -> u32 {
    3
}

fn default_confirmation_poll_ms() -> u64 {
    2_000
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_native_decimals() -> u32 {
    18
}

impl ServiceConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("DCHAT_WITHDRAWALS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

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

        if self.service.lock_retry_attempts == 0 {
            anyhow::bail!("service.lock_retry_attempts must be at least 1");
        }

        if !self.gas.priority_fee_gwei.is_ordered() {
            anyhow::bail!("gas.priority_fee_gwei must satisfy slow <= standard <= fast");
        }

        if !self.gas.legacy_multiplier_percent.is_ordered() {
            anyhow::bail!("gas.legacy_multiplier_percent must satisfy slow <= standard <= fast");
        }

        if self.database.url.is_empty() {
            tracing::warn!("No database URL configured - nonce records will not survive restarts");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        accounts = ["0x00000000000000000000000000000000000000aa"]

        [service]
        instance_id = "withdrawals-1"
        health_check_interval_secs = 30

        [database]
        url = "${DCHAT_TEST_DB_URL}"
        max_connections = 5
        min_connections = 1

        [api]
        host = "127.0.0.1"
        port = 8080

        [metrics]
        enabled = false
        port = 9090

        [chain]
        chain_id = 11155111
        name = "sepolia"
        rpc_urls = ["https://rpc.sepolia.org"]
        fee_model = "eip1559"
        max_gas_price_gwei = 500

        [gas.priority_fee_gwei]
        slow = 1
        standard = 2
        fast = 4

        [wallet]
        private_key_env = "WITHDRAWAL_PRIVATE_KEY"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("DCHAT_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${DCHAT_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn loads_file_with_defaults_filled_in() {
        env::set_var("DCHAT_TEST_DB_URL", "postgres://localhost/dchat");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();

        assert_eq!(settings.database.url, "postgres://localhost/dchat");
        assert_eq!(settings.chain.fee_model, FeeModel::Eip1559);
        assert_eq!(settings.service.lock_timeout_secs, 30);
        assert_eq!(settings.service.lock_retry_attempts, 10);
        assert_eq!(settings.service.instance_id, "withdrawals-1");
        assert_eq!(settings.chain.native_symbol, "ETH");
        assert_eq!(settings.gas.query_timeout_secs, 5);
        assert_eq!(settings.service.lock_retry_delay(), Duration::from_millis(500));
        assert_eq!(settings.gas.priority_fee_gwei.get(FeeStrategy::Fast), 4);
        assert_eq!(settings.gas.token_transfer_fallback_gas, 100_000);
        assert_eq!(settings.chain.native_decimals, 18);
        assert_eq!(settings.accounts.len(), 1);
    }

    #[test]
    fn rejects_unordered_strategy_table() {
        let broken = SAMPLE.replace("fast = 4", "fast = 0");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(broken.as_bytes()).unwrap();

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("priority_fee_gwei"));
    }
}
