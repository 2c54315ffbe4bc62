//! dchat withdrawal core
//!
//! Collision-free nonce allocation and fee estimation for payouts from the
//! application's hot wallets, plus the service pieces that keep nonce records
//! reconciled with the chain.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod store;
pub mod tx;
