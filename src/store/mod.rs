//! Nonce record persistence
//!
//! Handles:
//! - Lazy creation of per-account records
//! - Token+expiry account locks via atomic conditional updates
//! - Lock-guarded writes of nonce bookkeeping
//! - Sweeping locks abandoned by crashed holders

mod memory;
mod postgres;
mod record;

pub use memory::MemoryNonceStore;
pub use postgres::PgNonceStore;
pub use record::{account_key, NonceRecord, ReleaseOutcome, SyncReport};

use crate::error::WithdrawalResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Storage offering compare-and-swap semantics over [`NonceRecord`]s
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Read a record without locking it
    async fn load(&self, account: &str) -> WithdrawalResult<Option<NonceRecord>>;

    /// Create a record unless one exists; returns whether it was inserted
    async fn insert_if_absent(&self, record: &NonceRecord) -> WithdrawalResult<bool>;

    /// Atomically take the lock if it is free or expired at `now`
    async fn try_lock(
        &self,
        account: &str,
        token: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WithdrawalResult<bool>;

    /// Drop the lock if `token` still holds it; returns whether it did
    async fn unlock(&self, account: &str, token: Uuid) -> WithdrawalResult<bool>;

    /// Write nonce fields, only if `token` holds a live lock at `now`;
    /// returns whether the write happened
    async fn save_locked(
        &self,
        record: &NonceRecord,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> WithdrawalResult<bool>;

    /// Clear every lock that expired before `now`; returns the affected accounts
    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> WithdrawalResult<Vec<String>>;

    /// All known accounts
    async fn accounts(&self) -> WithdrawalResult<Vec<String>>;

    /// Whether the backing storage is reachable
    async fn health_check(&self) -> WithdrawalResult<()>;
}
