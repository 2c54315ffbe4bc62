//! Withdrawal submission: fee quote, nonce reservation, signing and broadcast

use super::gas::{CallKind, FeeParams, FeeQuote, FeeStrategy, GasEstimator, TotalCost};
use super::nonce::NonceAllocator;
use crate::chain::{CallParams, ChainClient};
use crate::config::{ServiceConfig, WalletConfig};
use crate::error::{WithdrawalError, WithdrawalResult};

use ethers::abi::{encode, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// `transfer(address,uint256)`
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// A payout requested by the application
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub to: Address,
    pub amount: U256,
    /// ERC-20 contract; `None` sends the native currency
    pub token: Option<Address>,
    pub strategy: FeeStrategy,
}

/// A broadcast withdrawal whose nonce is still reserved
#[derive(Debug, Clone)]
pub struct SubmittedWithdrawal {
    pub tx_hash: H256,
    pub from: Address,
    pub nonce: u64,
    pub quote: FeeQuote,
    pub max_cost: TotalCost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Confirmed,
    /// Mined but reverted; the nonce is still consumed
    Reverted,
    /// Not mined before the deadline; the reservation is left for sync
    Pending,
}

/// Why a broadcast did not produce a transaction hash
#[derive(Debug)]
enum BroadcastFailure {
    /// Nothing reached the node, or the node refused it; the nonce is free again
    Rejected(WithdrawalError),
    /// The node may hold the transaction; the nonce stays reserved until sync
    Uncertain(WithdrawalError),
}

/// Withdrawal sender with retry and nonce rollback
pub struct WithdrawalSender {
    chain: Arc<dyn ChainClient>,
    allocator: Arc<NonceAllocator>,
    estimator: Arc<GasEstimator>,
    /// Wallet for signing
    wallet: LocalWallet,
    send_timeout: Duration,
    max_send_retries: u32,
    retry_delay: Duration,
    poll_interval: Duration,
}

impl WithdrawalSender {
    /// Create a new withdrawal sender
    pub fn new(
        chain: Arc<dyn ChainClient>,
        allocator: Arc<NonceAllocator>,
        estimator: Arc<GasEstimator>,
        wallet: LocalWallet,
        config: &ServiceConfig,
    ) -> Self {
        info!("Withdrawal sender initialized with wallet: {:#x}", wallet.address());

        Self {
            chain,
            allocator,
            estimator,
            wallet,
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            max_send_retries: config.max_send_retries.max(1),
            retry_delay: config.lock_retry_delay(),
            poll_interval: Duration::from_millis(config.confirmation_poll_ms),
        }
    }

    /// Load the hot wallet from the configured environment variable
    pub fn load_wallet(config: &WalletConfig) -> WithdrawalResult<LocalWallet> {
        let var = config.private_key_env.as_deref().ok_or_else(|| {
            WithdrawalError::Wallet("No wallet configured. Set wallet.private_key_env".to_string())
        })?;

        let key = std::env::var(var)
            .map_err(|_| WithdrawalError::Wallet(format!("Environment variable {} not set", var)))?;

        key.trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| WithdrawalError::Wallet(format!("Invalid private key: {}", e)))
    }

    /// Sending account
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Quote, reserve a nonce, sign and broadcast a withdrawal
    pub async fn submit(&self, request: &WithdrawalRequest) -> WithdrawalResult<SubmittedWithdrawal> {
        let from = self.wallet.address();
        let (kind, call) = self.call_params(request);

        let quote = self.estimator.get_fee_quote(request.strategy).await;
        let gas_limit = self.estimator.estimate_gas_limit(kind, &call).await;
        let quote = quote.with_gas_limit(gas_limit);
        let max_cost = self.estimator.estimate_total_cost(gas_limit, &quote);

        let nonce = self.allocator.allocate_nonce(from).await?;
        let tx = self.build_tx(&call, nonce, &quote);

        match self.sign_and_send(tx).await {
            Ok(tx_hash) => {
                info!(
                    "Withdrawal sent: {:?} (nonce {}, max fee {} {}, {})",
                    tx_hash, nonce, max_cost.native_amount, max_cost.symbol, request.strategy
                );
                crate::metrics::record_withdrawal_submitted(self.chain.chain_id());
                Ok(SubmittedWithdrawal {
                    tx_hash,
                    from,
                    nonce,
                    quote,
                    max_cost,
                })
            }
            Err(BroadcastFailure::Uncertain(e)) => {
                warn!(
                    "Withdrawal with nonce {} may have reached the node ({}); keeping the nonce reserved until sync",
                    nonce, e
                );
                crate::metrics::record_withdrawal_failed(self.chain.chain_id());

                if e.to_string().contains("nonce too low") {
                    self.resync(from).await;
                }
                Err(e)
            }
            Err(BroadcastFailure::Rejected(e)) => {
                error!("Withdrawal with nonce {} failed: {}", nonce, e);
                crate::metrics::record_withdrawal_failed(self.chain.chain_id());

                if let Err(release_err) = self.allocator.release_nonce(from, nonce, false).await {
                    warn!("Failed to roll back nonce {}: {}", nonce, release_err);
                }

                if e.to_string().contains("nonce too low") {
                    self.resync(from).await;
                }

                Err(e)
            }
        }
    }

    async fn resync(&self, from: Address) {
        warn!("Nonce too low, syncing with chain");
        if let Err(sync_err) = self.allocator.sync_nonce(from).await {
            warn!("Nonce sync after rejection failed: {}", sync_err);
        }
    }

    /// Poll until the withdrawal is mined, then mark its nonce consumed
    pub async fn await_confirmation(
        &self,
        submitted: &SubmittedWithdrawal,
        deadline: Duration,
    ) -> WithdrawalResult<ConfirmationStatus> {
        let started = Instant::now();

        while started.elapsed() < deadline {
            match self.chain.get_transaction_status(submitted.tx_hash).await {
                Ok(Some(succeeded)) => {
                    self.allocator
                        .release_nonce(submitted.from, submitted.nonce, true)
                        .await?;

                    return Ok(if succeeded {
                        info!("Withdrawal {:?} confirmed", submitted.tx_hash);
                        ConfirmationStatus::Confirmed
                    } else {
                        warn!("Withdrawal {:?} reverted", submitted.tx_hash);
                        ConfirmationStatus::Reverted
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("Receipt query for {:?} failed: {}", submitted.tx_hash, e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        warn!(
            "Withdrawal {:?} not mined after {:?}; nonce {} stays reserved",
            submitted.tx_hash, deadline, submitted.nonce
        );
        Ok(ConfirmationStatus::Pending)
    }

    fn call_params(&self, request: &WithdrawalRequest) -> (CallKind, CallParams) {
        let from = self.wallet.address();
        match request.token {
            None => (
                CallKind::NativeTransfer,
                CallParams {
                    from,
                    to: request.to,
                    value: request.amount,
                    data: None,
                },
            ),
            Some(token) => (
                CallKind::TokenTransfer,
                CallParams {
                    from,
                    to: token,
                    value: U256::zero(),
                    data: Some(transfer_calldata(request.to, request.amount)),
                },
            ),
        }
    }

    /// Build the transaction for the quoted fee model
    fn build_tx(&self, call: &CallParams, nonce: u64, quote: &FeeQuote) -> TypedTransaction {
        let chain_id = self.chain.chain_id();
        let data = call.data.clone().unwrap_or_default();

        match quote.fee_params {
            FeeParams::Legacy { gas_price } => {
                let tx = TransactionRequest::new()
                    .from(call.from)
                    .to(call.to)
                    .value(call.value)
                    .data(data)
                    .nonce(nonce)
                    .gas(quote.gas_limit)
                    .gas_price(gas_price)
                    .chain_id(chain_id);
                TypedTransaction::Legacy(tx)
            }
            FeeParams::FeeMarket {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let tx = Eip1559TransactionRequest::new()
                    .from(call.from)
                    .to(call.to)
                    .value(call.value)
                    .data(data)
                    .nonce(nonce)
                    .gas(quote.gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(chain_id);
                TypedTransaction::Eip1559(tx)
            }
        }
    }

    /// Sign once, then broadcast with retry
    ///
    /// Once any attempt times out the outcome is uncertain: the node may have
    /// accepted the transaction without answering.
    async fn sign_and_send(&self, tx: TypedTransaction) -> Result<H256, BroadcastFailure> {
        let chain_id = self.chain.chain_id();
        let wallet = self.wallet.clone().with_chain_id(chain_id);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| BroadcastFailure::Rejected(WithdrawalError::Wallet(e.to_string())))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = H256::from(keccak256(&raw));

        let mut attempts = 0;
        let mut last_error = None;
        let mut uncertain = false;

        while attempts < self.max_send_retries {
            attempts += 1;

            match timeout(self.send_timeout, self.chain.send_raw_transaction(raw.clone())).await {
                Ok(Ok(hash)) => {
                    debug!(
                        "Transaction broadcast: {:?} (attempt {}/{})",
                        hash, attempts, self.max_send_retries
                    );
                    return Ok(hash);
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("already known") {
                        // An earlier attempt reached the node
                        return Ok(tx_hash);
                    } else if error_msg.contains("nonce too low") {
                        return Err(Self::classify(uncertain, e));
                    } else if error_msg.contains("insufficient funds") {
                        return Err(Self::classify(
                            uncertain,
                            WithdrawalError::InsufficientBalance {
                                chain_id,
                                have: "unknown".to_string(),
                                need: "unknown".to_string(),
                            },
                        ));
                    }

                    warn!("Broadcast failed (attempt {}): {}", attempts, error_msg);
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempts);
                    uncertain = true;
                    last_error = Some(WithdrawalError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            if attempts < self.max_send_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        let error = last_error
            .unwrap_or_else(|| WithdrawalError::Transaction("Unknown error".to_string()));
        Err(Self::classify(uncertain, error))
    }

    fn classify(uncertain: bool, error: WithdrawalError) -> BroadcastFailure {
        if uncertain {
            BroadcastFailure::Uncertain(error)
        } else {
            BroadcastFailure::Rejected(error)
        }
    }
}

/// ABI-encoded ERC-20 `transfer(to, amount)` call
pub fn transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = ERC20_TRANSFER_SELECTOR.to_vec();
    data.extend(encode(&[Token::Address(to), Token::Uint(amount)]));
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedChain;
    use crate::config::{ChainConfig, FeeModel, GasConfig};
    use crate::store::MemoryNonceStore;
    use crate::tx::nonce::LockPolicy;

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            instance_id: "test".to_string(),
            lock_timeout_secs: 30,
            lock_retry_attempts: 50,
            lock_retry_delay_ms: 1,
            lock_sweep_interval_secs: 15,
            nonce_sync_interval_secs: 60,
            health_check_interval_secs: 30,
            send_timeout_secs: 5,
            max_send_retries: 2,
            confirmation_poll_ms: 1,
        }
    }

    fn sender(chain: Arc<ScriptedChain>) -> WithdrawalSender {
        let config = service_config();
        let chain_config = ChainConfig {
            chain_id: chain.chain_id,
            name: "sepolia".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            fee_model: FeeModel::Auto,
            max_gas_price_gwei: 1_000,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
        };
        let allocator = Arc::new(NonceAllocator::new(
            chain.clone(),
            Arc::new(MemoryNonceStore::new()),
            LockPolicy::from(&config),
        ));
        let estimator = Arc::new(GasEstimator::new(
            chain.clone(),
            &GasConfig::default(),
            &chain_config,
        ));
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        WithdrawalSender::new(chain, allocator, estimator, wallet, &config)
    }

    fn native_request() -> WithdrawalRequest {
        WithdrawalRequest {
            to: Address::repeat_byte(0x11),
            amount: U256::exp10(16),
            token: None,
            strategy: FeeStrategy::Standard,
        }
    }

    #[tokio::test]
    async fn native_withdrawal_is_broadcast_and_confirmed() {
        let chain = Arc::new(ScriptedChain::new(42));
        let sender = sender(chain.clone());

        let submitted = sender.submit(&native_request()).await.unwrap();
        assert_eq!(submitted.nonce, 42);
        assert_eq!(submitted.quote.gas_limit, U256::from(21_000u64));
        assert!(submitted.quote.is_fee_market);
        assert_eq!(chain.broadcasts.lock().unwrap().len(), 1);

        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert!(record.pending_nonces.contains(&42));

        *chain.receipt.lock().unwrap() = Some(true);
        let status = sender
            .await_confirmation(&submitted, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, ConfirmationStatus::Confirmed);

        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert!(record.pending_nonces.is_empty());
        assert_eq!(record.local_nonce, 43);
    }

    #[tokio::test]
    async fn token_withdrawal_targets_contract_with_buffered_gas() {
        let chain = Arc::new(ScriptedChain::new(0));
        let sender = sender(chain);
        let token = Address::repeat_byte(0x22);

        let submitted = sender
            .submit(&WithdrawalRequest {
                token: Some(token),
                ..native_request()
            })
            .await
            .unwrap();

        assert_eq!(submitted.quote.gas_limit, U256::from(60_000u64));
    }

    #[tokio::test]
    async fn failed_broadcast_rolls_back_the_nonce() {
        let chain = Arc::new(ScriptedChain::new(7));
        *chain.fail_broadcast.lock().unwrap() = Some("connection reset".to_string());
        let sender = sender(chain);

        let err = sender.submit(&native_request()).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::Transaction(_)));

        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert_eq!(record.local_nonce, 7);
        assert!(record.pending_nonces.is_empty());
    }

    #[tokio::test]
    async fn nonce_too_low_resyncs_with_chain() {
        let chain = Arc::new(ScriptedChain::new(10));
        let sender = sender(chain.clone());
        sender.submit(&native_request()).await.unwrap();

        // the chain moved past our bookkeeping (external sends from the same wallet)
        chain.set_nonce(13);
        *chain.fail_broadcast.lock().unwrap() = Some("nonce too low".to_string());
        assert!(sender.submit(&native_request()).await.is_err());

        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert_eq!(record.chain_nonce, 13);
        assert_eq!(record.local_nonce, 13);
        assert!(record.pending_nonces.is_empty());
    }

    #[tokio::test]
    async fn timed_out_broadcast_keeps_its_nonce_reserved() {
        let chain = Arc::new(ScriptedChain::new(9));
        // the node takes the transaction but answers too late
        *chain.broadcast_delay.lock().unwrap() = Duration::from_millis(300);
        let mut sender = sender(chain.clone());
        sender.send_timeout = Duration::from_millis(20);
        sender.max_send_retries = 1;

        let err = sender.submit(&native_request()).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::Timeout { .. }));
        assert_eq!(chain.broadcasts.lock().unwrap().len(), 1);

        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert!(record.pending_nonces.contains(&9));
        assert_eq!(record.local_nonce, 10);

        // the next withdrawal must not reuse the possibly broadcast nonce
        let next = sender.allocator.allocate_nonce(sender.wallet_address()).await.unwrap();
        assert_eq!(next, 10);

        // once mined, sync clears the reservation
        chain.set_nonce(10);
        sender.allocator.sync_nonce(sender.wallet_address()).await.unwrap();
        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert!(!record.pending_nonces.contains(&9));
    }

    #[tokio::test]
    async fn unmined_withdrawal_keeps_its_reservation() {
        let chain = Arc::new(ScriptedChain::new(3));
        let sender = sender(chain);
        let submitted = sender.submit(&native_request()).await.unwrap();

        let status = sender
            .await_confirmation(&submitted, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(status, ConfirmationStatus::Pending);

        let record = sender.allocator.record(sender.wallet_address()).await.unwrap().unwrap();
        assert!(record.pending_nonces.contains(&3));
    }

    #[test]
    fn transfer_calldata_layout() {
        let to = Address::repeat_byte(0x33);
        let data = transfer_calldata(to, U256::from(5u64));

        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &ERC20_TRANSFER_SELECTOR);
        assert_eq!(&data[16..36], to.as_bytes());
        assert_eq!(data[67], 5);
    }
}
