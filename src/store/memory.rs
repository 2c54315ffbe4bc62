//! In-process nonce store
//!
//! Each DashMap entry guard is held across the whole read-modify-write, which
//! gives the same per-row atomicity as the Postgres conditional updates.

use super::{NonceRecord, NonceStore};
use crate::error::WithdrawalResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryNonceStore {
    records: DashMap<String, NonceRecord>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn load(&self, account: &str) -> WithdrawalResult<Option<NonceRecord>> {
        Ok(self.records.get(account).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(&self, record: &NonceRecord) -> WithdrawalResult<bool> {
        let mut inserted = false;
        self.records.entry(record.account.clone()).or_insert_with(|| {
            inserted = true;
            record.clone()
        });
        Ok(inserted)
    }

    async fn try_lock(
        &self,
        account: &str,
        token: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WithdrawalResult<bool> {
        let Some(mut record) = self.records.get_mut(account) else {
            return Ok(false);
        };

        if !record.lock_available(now) {
            return Ok(false);
        }

        record.lock_token = Some(token);
        record.lock_expires_at = Some(expires_at);
        record.updated_at = now;
        Ok(true)
    }

    async fn unlock(&self, account: &str, token: Uuid) -> WithdrawalResult<bool> {
        let Some(mut record) = self.records.get_mut(account) else {
            return Ok(false);
        };

        if record.lock_token != Some(token) {
            return Ok(false);
        }

        record.lock_token = None;
        record.lock_expires_at = None;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_locked(
        &self,
        record: &NonceRecord,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> WithdrawalResult<bool> {
        let Some(mut stored) = self.records.get_mut(&record.account) else {
            return Ok(false);
        };

        if !stored.is_held_by(token, now) {
            return Ok(false);
        }

        stored.chain_nonce = record.chain_nonce;
        stored.local_nonce = record.local_nonce;
        stored.pending_nonces = record.pending_nonces.clone();
        stored.gap_nonces = record.gap_nonces.clone();
        stored.updated_at = now;
        Ok(true)
    }

    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> WithdrawalResult<Vec<String>> {
        let mut cleared = Vec::new();

        for mut entry in self.records.iter_mut() {
            let expired = entry.lock_token.is_some()
                && entry.lock_expires_at.map_or(true, |at| at < now);
            if expired {
                entry.lock_token = None;
                entry.lock_expires_at = None;
                entry.updated_at = now;
                cleared.push(entry.key().clone());
            }
        }

        Ok(cleared)
    }

    async fn accounts(&self) -> WithdrawalResult<Vec<String>> {
        Ok(self.records.iter().map(|e| e.key().clone()).collect())
    }

    async fn health_check(&self) -> WithdrawalResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded(account: &str, nonce: u64) -> NonceRecord {
        NonceRecord::seeded(account.to_string(), nonce, Utc::now())
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_seed() {
        let store = MemoryNonceStore::new();
        assert!(store.insert_if_absent(&seeded("0xaa", 7)).await.unwrap());
        assert!(!store.insert_if_absent(&seeded("0xaa", 9)).await.unwrap());
        assert_eq!(store.load("0xaa").await.unwrap().unwrap().local_nonce, 7);
    }

    #[tokio::test]
    async fn second_locker_is_refused_until_unlock() {
        let store = MemoryNonceStore::new();
        store.insert_if_absent(&seeded("0xaa", 0)).await.unwrap();
        let now = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.try_lock("0xaa", a, now + Duration::seconds(30), now).await.unwrap());
        assert!(!store.try_lock("0xaa", b, now + Duration::seconds(30), now).await.unwrap());
        assert!(!store.unlock("0xaa", b).await.unwrap());
        assert!(store.unlock("0xaa", a).await.unwrap());
        assert!(store.try_lock("0xaa", b, now + Duration::seconds(30), now).await.unwrap());
    }

    #[tokio::test]
    async fn save_requires_live_lock() {
        let store = MemoryNonceStore::new();
        store.insert_if_absent(&seeded("0xaa", 3)).await.unwrap();
        let now = Utc::now();
        let token = Uuid::new_v4();

        let mut update = seeded("0xaa", 3);
        update.reserve_next();
        assert!(!store.save_locked(&update, token, now).await.unwrap());

        store.try_lock("0xaa", token, now + Duration::seconds(5), now).await.unwrap();
        assert!(store.save_locked(&update, token, now).await.unwrap());
        assert_eq!(store.load("0xaa").await.unwrap().unwrap().local_nonce, 4);

        let too_late = now + Duration::seconds(6);
        assert!(!store.save_locked(&update, token, too_late).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_clears_only_expired_locks() {
        let store = MemoryNonceStore::new();
        store.insert_if_absent(&seeded("0xaa", 0)).await.unwrap();
        store.insert_if_absent(&seeded("0xbb", 0)).await.unwrap();
        let now = Utc::now();

        store
            .try_lock("0xaa", Uuid::new_v4(), now - Duration::seconds(1), now - Duration::seconds(2))
            .await
            .unwrap();
        store
            .try_lock("0xbb", Uuid::new_v4(), now + Duration::seconds(30), now)
            .await
            .unwrap();

        let cleared = store.clear_expired_locks(now).await.unwrap();
        assert_eq!(cleared, vec!["0xaa".to_string()]);
        assert!(store.load("0xaa").await.unwrap().unwrap().lock_token.is_none());
        assert!(store.load("0xbb").await.unwrap().unwrap().lock_token.is_some());
    }
}
