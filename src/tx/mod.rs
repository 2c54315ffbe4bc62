//! Transaction submission module with nonce management and gas estimation

mod gas;
mod nonce;
mod withdrawal;

pub use gas::{CallKind, FeeParams, FeeQuote, FeeStrategy, GasEstimator, TotalCost};
pub use nonce::{LockPolicy, LockToken, NonceAllocator};
pub use withdrawal::{
    transfer_calldata, ConfirmationStatus, SubmittedWithdrawal, WithdrawalRequest, WithdrawalSender,
};
