//! Nonce allocation for reliable transaction submission
//!
//! Handles:
//! - Per-account token+expiry locks held in the nonce store
//! - Collision-free nonce reservation under concurrent requests
//! - Rollback of failed submissions without reordering hazards
//! - Reconciliation against on-chain state and stale lock sweeps

use crate::chain::ChainClient;
use crate::config::ServiceConfig;
use crate::error::{WithdrawalError, WithdrawalResult};
use crate::store::{account_key, NonceRecord, NonceStore, ReleaseOutcome, SyncReport};

use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lock retry policy
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// How long a taken lock stays valid
    pub timeout: Duration,
    /// Attempts before giving up with `LockTimeout`
    pub max_attempts: u32,
    /// Spacing between attempts
    pub retry_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 10,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl From<&ServiceConfig> for LockPolicy {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            timeout: config.lock_timeout(),
            max_attempts: config.lock_retry_attempts,
            retry_delay: config.lock_retry_delay(),
        }
    }
}

/// Proof of holding an account lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub account: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LockToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Hands out per-account nonces backed by a persistent store
pub struct NonceAllocator {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn NonceStore>,
    policy: LockPolicy,
}

impl NonceAllocator {
    /// Create a new nonce allocator
    pub fn new(chain: Arc<dyn ChainClient>, store: Arc<dyn NonceStore>, policy: LockPolicy) -> Self {
        Self {
            chain,
            store,
            policy,
        }
    }

    /// Take the account lock, retrying while another holder has it
    pub async fn acquire_lock(
        &self,
        account: Address,
        timeout: Duration,
    ) -> WithdrawalResult<LockToken> {
        let key = account_key(account);
        self.ensure_record(account, &key).await?;

        let ttl = chrono::Duration::from_std(timeout)
            .map_err(|e| WithdrawalError::Config(format!("Invalid lock timeout: {}", e)))?;
        let token = Uuid::new_v4();
        let started = Instant::now();

        for attempt in 1..=self.policy.max_attempts {
            if let Some(lock) = self.try_lock_once(&key, token, ttl).await? {
                debug!("Acquired nonce lock for {} (attempt {})", key, attempt);
                crate::metrics::record_lock_wait(started.elapsed().as_secs_f64());
                return Ok(lock);
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        // A crashed holder may be what's blocking us
        if self.cleanup_expired_locks().await? > 0 {
            if let Some(lock) = self.try_lock_once(&key, token, ttl).await? {
                crate::metrics::record_lock_wait(started.elapsed().as_secs_f64());
                return Ok(lock);
            }
        }

        warn!(
            "Timed out acquiring nonce lock for {} after {} attempts",
            key, self.policy.max_attempts
        );
        crate::metrics::record_lock_timeout();
        Err(WithdrawalError::LockTimeout {
            account: key,
            attempts: self.policy.max_attempts,
        })
    }

    async fn try_lock_once(
        &self,
        key: &str,
        token: Uuid,
        ttl: chrono::Duration,
    ) -> WithdrawalResult<Option<LockToken>> {
        let now = Utc::now();
        let expires_at = now + ttl;

        if self.store.try_lock(key, token, expires_at, now).await? {
            Ok(Some(LockToken {
                account: key.to_string(),
                token,
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    /// Give the lock back
    pub async fn release_lock(&self, lock: &LockToken) -> WithdrawalResult<()> {
        if !self.store.unlock(&lock.account, lock.token).await? {
            warn!(
                "Nonce lock for {} expired before release; another holder may have taken it",
                lock.account
            );
        }
        Ok(())
    }

    /// Reserve the next nonce for an account
    pub async fn allocate_nonce(&self, account: Address) -> WithdrawalResult<u64> {
        let nonce = self
            .with_lock(account, |record, _| record.reserve_next())
            .await?;

        debug!("Allocated nonce {} for {:#x}", nonce, account);
        crate::metrics::record_nonce_allocated(self.chain.chain_id());
        Ok(nonce)
    }

    /// Reserve the next nonce with a lock the caller already holds
    pub async fn allocate_with_lock(&self, lock: &LockToken) -> WithdrawalResult<u64> {
        let nonce = self
            .apply_locked(lock, |record, _| record.reserve_next())
            .await?;

        debug!("Allocated nonce {} for {}", nonce, lock.account);
        crate::metrics::record_nonce_allocated(self.chain.chain_id());
        Ok(nonce)
    }

    /// Finish a reservation: consumed on success, rolled back on failure
    pub async fn release_nonce(
        &self,
        account: Address,
        nonce: u64,
        success: bool,
    ) -> WithdrawalResult<ReleaseOutcome> {
        // Nothing was ever reserved for an unknown account; don't seed one
        let outcome = if self.store.load(&account_key(account)).await?.is_none() {
            ReleaseOutcome::NotPending
        } else {
            self.with_lock(account, |record, _| record.release(nonce, success))
                .await?
        };

        match outcome {
            ReleaseOutcome::Gap => warn!(
                "Nonce {} for {:#x} failed below a pending nonce; left as a gap until resync",
                nonce, account
            ),
            ReleaseOutcome::NotPending => warn!(
                "Nonce {} for {:#x} was not pending when released",
                nonce, account
            ),
            _ => debug!("Released nonce {} for {:#x}: {:?}", nonce, account, outcome),
        }

        crate::metrics::record_nonce_released(self.chain.chain_id(), outcome);
        Ok(outcome)
    }

    /// Reconcile local bookkeeping with the chain's transaction count
    pub async fn sync_nonce(&self, account: Address) -> WithdrawalResult<SyncReport> {
        // Network first, without holding the lock
        let chain_nonce = self.chain.get_transaction_count(account).await?;

        let report = self
            .with_lock(account, |record, _| record.reconcile(chain_nonce))
            .await?;

        if report.drift > 0 {
            warn!(
                "Nonce drift for {}: chain advanced {} past local bookkeeping, now at {}",
                report.account, report.drift, report.chain_nonce
            );
            crate::metrics::record_nonce_drift(self.chain.chain_id());
        }
        if report.rewound {
            info!(
                "Reclaimed abandoned nonces for {}: local nonce rewound to {}",
                report.account, report.local_nonce
            );
        }

        Ok(report)
    }

    /// Sync every known account; different accounts proceed in parallel
    pub async fn sync_all(&self, extra_accounts: &[Address]) -> Vec<(Address, WithdrawalResult<SyncReport>)> {
        let mut accounts: Vec<Address> = extra_accounts.to_vec();
        match self.store.accounts().await {
            Ok(keys) => {
                for key in keys {
                    match Address::from_str(&key) {
                        Ok(address) if !accounts.contains(&address) => accounts.push(address),
                        Ok(_) => {}
                        Err(e) => warn!("Skipping malformed account {}: {}", key, e),
                    }
                }
            }
            Err(e) => warn!("Failed to list accounts for sync: {}", e),
        }

        let syncs = accounts.into_iter().map(|account| async move {
            let result = self.sync_nonce(account).await;
            (account, result)
        });

        futures::future::join_all(syncs).await
    }

    /// Clear locks left behind by crashed holders
    pub async fn cleanup_expired_locks(&self) -> WithdrawalResult<usize> {
        let cleared = self.store.clear_expired_locks(Utc::now()).await?;

        if !cleared.is_empty() {
            warn!("Cleared {} expired nonce locks: {:?}", cleared.len(), cleared);
            crate::metrics::record_locks_expired(cleared.len());
        }

        Ok(cleared.len())
    }

    /// Current record of an account, if any
    pub async fn record(&self, account: Address) -> WithdrawalResult<Option<NonceRecord>> {
        self.store.load(&account_key(account)).await
    }

    /// Whether the nonce store is reachable
    pub async fn store_health(&self) -> WithdrawalResult<()> {
        self.store.health_check().await
    }

    /// Create the record on first use, seeded from the network
    async fn ensure_record(&self, account: Address, key: &str) -> WithdrawalResult<()> {
        if self.store.load(key).await?.is_some() {
            return Ok(());
        }

        // A brand-new account must be seeded from a real chain value
        let chain_nonce = self.chain.get_transaction_count(account).await?;
        let record = NonceRecord::seeded(key.to_string(), chain_nonce, Utc::now());

        if self.store.insert_if_absent(&record).await? {
            info!("Initialized nonce record for {} at {}", key, chain_nonce);
        }
        Ok(())
    }

    /// Run `f` on the account's record under its lock; the lock is released on
    /// every exit path
    async fn with_lock<T, F>(&self, account: Address, f: F) -> WithdrawalResult<T>
    where
        F: FnOnce(&mut NonceRecord, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        let lock = self.acquire_lock(account, self.policy.timeout).await?;
        let result = self.apply_locked(&lock, f).await;

        if let Err(e) = self.release_lock(&lock).await {
            warn!("Failed to release nonce lock for {}: {}", lock.account, e);
        }

        result
    }

    async fn apply_locked<T, F>(&self, lock: &LockToken, f: F) -> WithdrawalResult<T>
    where
        F: FnOnce(&mut NonceRecord, DateTime<Utc>) -> T + Send,
        T: Send,
    {
        let now = Utc::now();
        if lock.is_expired(now) {
            return Err(WithdrawalError::LockNotHeld {
                account: lock.account.clone(),
            });
        }

        let mut record = self.store.load(&lock.account).await?.ok_or_else(|| {
            WithdrawalError::Internal(format!("No nonce record for {}", lock.account))
        })?;

        let output = f(&mut record, now);
        record.updated_at = now;

        if !self.store.save_locked(&record, lock.token, now).await? {
            return Err(WithdrawalError::LockNotHeld {
                account: lock.account.clone(),
            });
        }

        Ok(output)
    }
}
