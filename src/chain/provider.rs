//! Chain provider with multi-RPC support and automatic failover

use super::{CallParams, ChainClient};
use crate::config::ChainConfig;
use crate::error::{WithdrawalError, WithdrawalResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> WithdrawalResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(WithdrawalError::NetworkQuery {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a read-only query against each provider in turn until one answers
    async fn with_failover<'a, T, F, Fut>(&'a self, operation: &str, query: F) -> WithdrawalResult<T>
    where
        F: Fn(&'a Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::from("no providers");

        for _ in 0..self.http_providers.len() {
            match query(self.http()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "Failed to {} on chain {}: {}",
                        operation, self.config.chain_id, e
                    );
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(WithdrawalError::NetworkQuery {
            chain_id: self.config.chain_id,
            message: format!("{}: {}", operation, last_error),
        })
    }

    /// Chain configuration
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn get_transaction_count(&self, account: Address) -> WithdrawalResult<u64> {
        let count = self
            .with_failover("get transaction count", |p| {
                p.get_transaction_count(account, Some(BlockNumber::Latest.into()))
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn estimate_gas(&self, call: &CallParams) -> WithdrawalResult<U256> {
        let mut request = TransactionRequest::new()
            .from(call.from)
            .to(call.to)
            .value(call.value);
        if let Some(data) = &call.data {
            request = request.data(data.clone());
        }
        let tx: TypedTransaction = request.into();

        // A reverted simulation is not a transport problem; don't fail over on it
        self.http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| WithdrawalError::GasEstimation(e.to_string()))
    }

    async fn get_base_fee(&self) -> WithdrawalResult<Option<U256>> {
        let block = self
            .with_failover("get latest block", |p| p.get_block(BlockNumber::Latest))
            .await?
            .ok_or_else(|| WithdrawalError::NetworkQuery {
                chain_id: self.config.chain_id,
                message: "No latest block".to_string(),
            })?;

        Ok(block.base_fee_per_gas)
    }

    async fn get_gas_price(&self) -> WithdrawalResult<U256> {
        self.with_failover("get gas price", |p| p.get_gas_price())
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> WithdrawalResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| WithdrawalError::Transaction(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn get_transaction_status(&self, tx_hash: H256) -> WithdrawalResult<Option<bool>> {
        let receipt = self
            .with_failover("get transaction receipt", |p| {
                p.get_transaction_receipt(tx_hash)
            })
            .await?;

        Ok(receipt.map(|r| r.status == Some(U64::from(1u64))))
    }

    async fn health_check(&self) -> bool {
        match self.with_failover("get block number", |p| p.get_block_number()).await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}
