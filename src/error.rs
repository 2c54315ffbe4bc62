//! Error types for the withdrawal core

use thiserror::Error;

/// Main error type for nonce allocation, fee estimation and submission
#[derive(Error, Debug)]
pub enum WithdrawalError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Timed out acquiring nonce lock for {account} after {attempts} attempts")]
    LockTimeout { account: String, attempts: u32 },

    #[error("Nonce lock for {account} is not held by this caller")]
    LockNotHeld { account: String },

    #[error("Network query failed on chain {chain_id}: {message}")]
    NetworkQuery { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WithdrawalError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WithdrawalError::LockTimeout { .. }
                | WithdrawalError::NetworkQuery { .. }
                | WithdrawalError::Timeout { .. }
        )
    }

    /// Message suitable for showing to the person requesting the withdrawal
    pub fn user_message(&self) -> &'static str {
        match self {
            WithdrawalError::LockTimeout { .. } | WithdrawalError::Timeout { .. } => {
                "Network busy, please try again"
            }
            WithdrawalError::NetworkQuery { .. } => {
                "Blockchain network unavailable, please try again"
            }
            WithdrawalError::InsufficientBalance { .. } => "Insufficient balance for withdrawal",
            _ => "Withdrawal service error",
        }
    }
}

impl From<sqlx::Error> for WithdrawalError {
    fn from(e: sqlx::Error) -> Self {
        WithdrawalError::Persistence(e.to_string())
    }
}

/// Result type for withdrawal operations
pub type WithdrawalResult<T> = Result<T, WithdrawalError>;
