//! Chain module - the network capabilities the withdrawal core depends on
//!
//! The allocator and estimator only see the [`ChainClient`] trait, so tests
//! and alternative networks can substitute their own client. [`ChainProvider`]
//! is the ethers-backed implementation with multi-RPC failover.

pub mod provider;

pub use provider::ChainProvider;

use crate::error::WithdrawalResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// A call to simulate or submit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallParams {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
}

/// Network operations needed for nonce bookkeeping, fee estimation and broadcast
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain ID of the network
    fn chain_id(&self) -> u64;

    /// Confirmed transaction count (next nonce) of an account
    async fn get_transaction_count(&self, account: Address) -> WithdrawalResult<u64>;

    /// Simulate a call and return the gas it uses
    async fn estimate_gas(&self, call: &CallParams) -> WithdrawalResult<U256>;

    /// Base fee of the latest block, `None` on networks without a fee market
    async fn get_base_fee(&self) -> WithdrawalResult<Option<U256>>;

    /// Legacy gas price
    async fn get_gas_price(&self) -> WithdrawalResult<U256>;

    /// Broadcast a signed, RLP-encoded transaction
    async fn send_raw_transaction(&self, raw: Bytes) -> WithdrawalResult<H256>;

    /// `Some(true)` mined and succeeded, `Some(false)` mined and reverted,
    /// `None` not mined yet
    async fn get_transaction_status(&self, tx_hash: H256) -> WithdrawalResult<Option<bool>>;

    /// Whether the network is reachable
    async fn health_check(&self) -> bool;
}
