//! Gas estimation and fee bidding
//!
//! Network failures never escape this module: every query has a cached or
//! configured fallback, so fee estimation cannot block a withdrawal.

use crate::chain::{CallParams, ChainClient};
use crate::config::{ChainConfig, FeeModel, GasConfig, StrategyTable};
use crate::error::{WithdrawalError, WithdrawalResult};

use ethers::types::U256;
use ethers::utils::format_units;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;

/// Caller-selected speed/cost tradeoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStrategy {
    Slow,
    #[default]
    Standard,
    Fast,
}

impl FeeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeStrategy::Slow => "slow",
            FeeStrategy::Standard => "standard",
            FeeStrategy::Fast => "fast",
        }
    }
}

impl fmt::Display for FeeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slow" => Ok(FeeStrategy::Slow),
            "standard" => Ok(FeeStrategy::Standard),
            "fast" => Ok(FeeStrategy::Fast),
            other => Err(format!("unknown fee strategy: {}", other)),
        }
    }
}

/// What is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    NativeTransfer,
    TokenTransfer,
}

/// Per-unit fee parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeParams {
    Legacy {
        gas_price: U256,
    },
    FeeMarket {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeParams {
    /// Upper bound paid per gas unit
    pub fn effective_fee_per_gas(&self) -> U256 {
        match self {
            FeeParams::Legacy { gas_price } => *gas_price,
            FeeParams::FeeMarket { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }
}

/// A single fee estimate; computed fresh per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub strategy: FeeStrategy,
    pub is_fee_market: bool,
    pub gas_limit: U256,
    pub fee_params: FeeParams,
}

impl FeeQuote {
    pub fn with_gas_limit(mut self, gas_limit: U256) -> Self {
        self.gas_limit = gas_limit;
        self
    }
}

/// Worst-case cost of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalCost {
    /// In the smallest unit (wei)
    pub fee_units: U256,
    /// In the native display denomination
    pub native_amount: String,
    /// Native currency symbol, e.g. `ETH`
    pub symbol: String,
}

#[derive(Debug, Clone, Copy)]
enum FeeSnapshot {
    BaseFee(U256),
    GasPrice(U256),
}

/// Gas estimator for withdrawals
pub struct GasEstimator {
    chain: Arc<dyn ChainClient>,
    fee_model: FeeModel,
    native_transfer_gas: U256,
    token_transfer_fallback_gas: U256,
    /// Buffer percentage for simulated gas limits (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    priority_fees: StrategyTable<U256>,
    legacy_multiplier_percent: StrategyTable<u64>,
    fallback_base_fee: U256,
    fallback_gas_price: U256,
    max_fee_cap: U256,
    native_decimals: u32,
    native_symbol: String,
    /// Upper bound on each network query
    query_timeout: Duration,
    cache_ttl: Duration,
    last_fees: RwLock<Option<(FeeSnapshot, Instant)>>,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(chain: Arc<dyn ChainClient>, gas: &GasConfig, chain_config: &ChainConfig) -> Self {
        let gwei = |v: u64| U256::from(v) * U256::from(GWEI);

        Self {
            chain,
            fee_model: chain_config.fee_model,
            native_transfer_gas: U256::from(gas.native_transfer_gas),
            token_transfer_fallback_gas: U256::from(gas.token_transfer_fallback_gas),
            gas_limit_buffer_percent: gas.gas_limit_buffer_percent,
            priority_fees: StrategyTable {
                slow: gwei(gas.priority_fee_gwei.slow),
                standard: gwei(gas.priority_fee_gwei.standard),
                fast: gwei(gas.priority_fee_gwei.fast),
            },
            legacy_multiplier_percent: gas.legacy_multiplier_percent,
            fallback_base_fee: gwei(gas.fallback_base_fee_gwei),
            fallback_gas_price: gwei(gas.fallback_gas_price_gwei),
            max_fee_cap: gwei(chain_config.max_gas_price_gwei),
            native_decimals: chain_config.native_decimals,
            native_symbol: chain_config.native_symbol.clone(),
            query_timeout: Duration::from_secs(gas.query_timeout_secs),
            cache_ttl: Duration::from_secs(gas.fee_cache_ttl_secs),
            last_fees: RwLock::new(None),
        }
    }

    /// Gas limit for a call
    pub async fn estimate_gas_limit(&self, kind: CallKind, call: &CallParams) -> U256 {
        match kind {
            CallKind::NativeTransfer => self.native_transfer_gas,
            CallKind::TokenTransfer => match self
                .bounded("gas simulation", self.chain.estimate_gas(call))
                .await
            {
                Ok(base_gas) => {
                    let buffer = base_gas * self.gas_limit_buffer_percent / 100;
                    base_gas + buffer
                }
                Err(e) => {
                    warn!(
                        "Token transfer simulation failed on chain {}, using fallback gas limit {}: {}",
                        self.chain.chain_id(),
                        self.token_transfer_fallback_gas,
                        e
                    );
                    crate::metrics::record_fee_fallback("gas_limit");
                    self.token_transfer_fallback_gas
                }
            },
        }
    }

    /// Fee bid for the given strategy, priced for a native transfer
    pub async fn get_fee_quote(&self, strategy: FeeStrategy) -> FeeQuote {
        let fee_params = match self.current_fees().await {
            FeeSnapshot::BaseFee(base_fee) => {
                let max_fee = base_fee * 2 + self.priority_fees.get(strategy);
                let max_fee = std::cmp::min(max_fee, self.max_fee_cap);
                let priority_fee = std::cmp::min(self.priority_fees.get(strategy), max_fee);
                FeeParams::FeeMarket {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                }
            }
            FeeSnapshot::GasPrice(price) => {
                let price = price * self.legacy_multiplier_percent.get(strategy) / 100;
                FeeParams::Legacy {
                    gas_price: std::cmp::min(price, self.max_fee_cap),
                }
            }
        };

        let quote = FeeQuote {
            strategy,
            is_fee_market: matches!(fee_params, FeeParams::FeeMarket { .. }),
            gas_limit: self.native_transfer_gas,
            fee_params,
        };

        debug!(
            "Fee quote for chain {} ({}): {:?}",
            self.chain.chain_id(),
            strategy,
            quote.fee_params
        );
        quote
    }

    /// Total worst-case fee of `gas_limit` units at the quoted price
    pub fn estimate_total_cost(&self, gas_limit: U256, quote: &FeeQuote) -> TotalCost {
        let fee_units = Self::calculate_cost(gas_limit, &quote.fee_params);
        let native_amount = format_units(fee_units, self.native_decimals)
            .unwrap_or_else(|_| fee_units.to_string());

        TotalCost {
            fee_units,
            native_amount,
            symbol: self.native_symbol.clone(),
        }
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, fee_params: &FeeParams) -> U256 {
        gas_limit * fee_params.effective_fee_per_gas()
    }

    async fn current_fees(&self) -> FeeSnapshot {
        let queried = match self.fee_model {
            FeeModel::Legacy => self
                .bounded("gas price", self.chain.get_gas_price())
                .await
                .map(FeeSnapshot::GasPrice),
            FeeModel::Eip1559 => self
                .bounded("base fee", self.chain.get_base_fee())
                .await
                .map(|fee| FeeSnapshot::BaseFee(fee.unwrap_or(self.fallback_base_fee))),
            FeeModel::Auto => match self.bounded("base fee", self.chain.get_base_fee()).await {
                Ok(Some(base_fee)) => Ok(FeeSnapshot::BaseFee(base_fee)),
                Ok(None) => self
                    .bounded("gas price", self.chain.get_gas_price())
                    .await
                    .map(FeeSnapshot::GasPrice),
                Err(e) => Err(e),
            },
        };

        match queried {
            Ok(snapshot) => {
                *self.last_fees.write().await = Some((snapshot, Instant::now()));
                snapshot
            }
            Err(e) => {
                let cached = *self.last_fees.read().await;
                match cached {
                    Some((snapshot, at)) if at.elapsed() <= self.cache_ttl => {
                        warn!("Fee query failed, using cached fees: {}", e);
                        crate::metrics::record_fee_fallback("cached_fees");
                        snapshot
                    }
                    _ => {
                        warn!("Fee query failed, using default fees: {}", e);
                        crate::metrics::record_fee_fallback("default_fees");
                        self.default_fees()
                    }
                }
            }
        }
    }

    /// A hung node counts as a failed query
    async fn bounded<T>(
        &self,
        operation: &str,
        query: impl Future<Output = WithdrawalResult<T>>,
    ) -> WithdrawalResult<T> {
        match timeout(self.query_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(WithdrawalError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    fn default_fees(&self) -> FeeSnapshot {
        match self.fee_model {
            FeeModel::Eip1559 => FeeSnapshot::BaseFee(self.fallback_base_fee),
            // Legacy pricing is accepted by fee-market networks too
            FeeModel::Legacy | FeeModel::Auto => FeeSnapshot::GasPrice(self.fallback_gas_price),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{ScriptedChain, GWEI};
    use crate::chain::MockChainClient;

    fn chain_config(fee_model: FeeModel) -> ChainConfig {
        ChainConfig {
            chain_id: 11155111,
            name: "sepolia".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            fee_model,
            max_gas_price_gwei: 1_000,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
        }
    }

    fn estimator(chain: Arc<dyn ChainClient>, fee_model: FeeModel) -> GasEstimator {
        GasEstimator::new(chain, &GasConfig::default(), &chain_config(fee_model))
    }

    fn gwei(v: u64) -> U256 {
        U256::from(v) * U256::from(GWEI)
    }

    #[tokio::test]
    async fn fast_fee_market_quote_doubles_base_fee() {
        let chain = Arc::new(ScriptedChain::new(0));
        let estimator = estimator(chain, FeeModel::Eip1559);

        let quote = estimator.get_fee_quote(FeeStrategy::Fast).await;

        assert!(quote.is_fee_market);
        assert_eq!(
            quote.fee_params,
            FeeParams::FeeMarket {
                max_fee_per_gas: gwei(23),
                max_priority_fee_per_gas: gwei(3),
            }
        );
    }

    #[tokio::test]
    async fn priority_fee_follows_strategy_order() {
        let chain = Arc::new(ScriptedChain::new(0));
        let estimator = estimator(chain, FeeModel::Auto);

        let mut previous = U256::zero();
        for strategy in [FeeStrategy::Slow, FeeStrategy::Standard, FeeStrategy::Fast] {
            match estimator.get_fee_quote(strategy).await.fee_params {
                FeeParams::FeeMarket {
                    max_priority_fee_per_gas,
                    ..
                } => {
                    assert!(max_priority_fee_per_gas > previous);
                    previous = max_priority_fee_per_gas;
                }
                other => panic!("expected fee market params, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn auto_model_uses_legacy_without_base_fee() {
        let chain = Arc::new(ScriptedChain::new(0));
        *chain.base_fee.lock().unwrap() = None;
        *chain.gas_price.lock().unwrap() = gwei(20);
        let estimator = estimator(chain, FeeModel::Auto);

        let quote = estimator.get_fee_quote(FeeStrategy::Fast).await;

        assert!(!quote.is_fee_market);
        assert_eq!(quote.fee_params, FeeParams::Legacy { gas_price: gwei(25) });
    }

    #[tokio::test]
    async fn fee_bid_is_capped() {
        let chain = Arc::new(ScriptedChain::new(0));
        *chain.base_fee.lock().unwrap() = Some(gwei(900));
        let estimator = estimator(chain, FeeModel::Eip1559);

        let quote = estimator.get_fee_quote(FeeStrategy::Standard).await;
        assert_eq!(quote.fee_params.effective_fee_per_gas(), gwei(1_000));
    }

    #[tokio::test]
    async fn native_transfer_uses_intrinsic_gas_without_simulating() {
        let mut chain = MockChainClient::new();
        chain.expect_estimate_gas().never();
        let estimator = estimator(Arc::new(chain), FeeModel::Legacy);

        let limit = estimator
            .estimate_gas_limit(CallKind::NativeTransfer, &CallParams::default())
            .await;
        assert_eq!(limit, U256::from(21_000u64));
    }

    #[tokio::test]
    async fn token_transfer_adds_buffer_to_simulation() {
        let chain = Arc::new(ScriptedChain::new(0));
        let estimator = estimator(chain, FeeModel::Auto);

        let limit = estimator
            .estimate_gas_limit(CallKind::TokenTransfer, &CallParams::default())
            .await;
        assert_eq!(limit, U256::from(60_000u64));
    }

    #[tokio::test]
    async fn token_transfer_falls_back_when_simulation_fails() {
        let mut chain = MockChainClient::new();
        chain.expect_chain_id().return_const(1u64);
        chain
            .expect_estimate_gas()
            .times(1)
            .returning(|_| Err(WithdrawalError::GasEstimation("execution reverted".to_string())));
        let estimator = estimator(Arc::new(chain), FeeModel::Auto);

        let limit = estimator
            .estimate_gas_limit(CallKind::TokenTransfer, &CallParams::default())
            .await;
        assert_eq!(limit, U256::from(100_000u64));
    }

    #[tokio::test]
    async fn fee_query_failure_uses_cache_then_defaults() {
        let chain = Arc::new(ScriptedChain::new(0));
        let estimator = estimator(chain.clone(), FeeModel::Eip1559);

        let live = estimator.get_fee_quote(FeeStrategy::Standard).await;
        chain.set_failing(true);
        let cached = estimator.get_fee_quote(FeeStrategy::Standard).await;
        assert_eq!(live, cached);

        let cold = GasEstimator::new(
            chain,
            &GasConfig::default(),
            &chain_config(FeeModel::Eip1559),
        );
        let quote = cold.get_fee_quote(FeeStrategy::Standard).await;
        // fallback base fee 30 gwei, standard priority 2 gwei
        assert_eq!(quote.fee_params.effective_fee_per_gas(), gwei(62));
    }

    #[tokio::test]
    async fn auto_model_without_any_data_falls_back_to_legacy_price() {
        let chain = Arc::new(ScriptedChain::new(0));
        chain.set_failing(true);
        let estimator = estimator(chain, FeeModel::Auto);

        let quote = estimator.get_fee_quote(FeeStrategy::Slow).await;
        assert_eq!(quote.fee_params, FeeParams::Legacy { gas_price: gwei(45) });
    }

    #[test]
    fn total_cost_is_formatted_in_native_units() {
        let estimator = estimator(Arc::new(ScriptedChain::new(0)), FeeModel::Eip1559);
        let quote = FeeQuote {
            strategy: FeeStrategy::Fast,
            is_fee_market: true,
            gas_limit: U256::from(21_000u64),
            fee_params: FeeParams::FeeMarket {
                max_fee_per_gas: gwei(23),
                max_priority_fee_per_gas: gwei(3),
            },
        };

        let cost = estimator.estimate_total_cost(quote.gas_limit, &quote);
        assert_eq!(cost.fee_units, U256::from(483_000u64) * U256::from(GWEI));
        assert_eq!(cost.native_amount, "0.000483000000000000");
        assert_eq!(cost.symbol, "ETH");
    }

    #[tokio::test]
    async fn hung_fee_query_degrades_to_cache() {
        let chain = Arc::new(ScriptedChain::new(0));
        let mut estimator = estimator(chain.clone(), FeeModel::Eip1559);
        estimator.query_timeout = Duration::from_millis(50);

        let live = estimator.get_fee_quote(FeeStrategy::Standard).await;

        *chain.query_delay.lock().unwrap() = Duration::from_secs(20);
        let started = Instant::now();
        let quote = estimator.get_fee_quote(FeeStrategy::Standard).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(quote, live);
    }

    #[tokio::test]
    async fn hung_simulation_uses_fallback_gas_limit() {
        let chain = Arc::new(ScriptedChain::new(0));
        *chain.query_delay.lock().unwrap() = Duration::from_secs(20);
        let mut estimator = estimator(chain, FeeModel::Auto);
        estimator.query_timeout = Duration::from_millis(50);

        let started = Instant::now();
        let limit = estimator
            .estimate_gas_limit(CallKind::TokenTransfer, &CallParams::default())
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(limit, U256::from(100_000u64));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("FAST".parse::<FeeStrategy>().unwrap(), FeeStrategy::Fast);
        assert_eq!(FeeStrategy::default(), FeeStrategy::Standard);
        assert!("turbo".parse::<FeeStrategy>().is_err());
    }
}
