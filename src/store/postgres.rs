//! PostgreSQL nonce store

use super::{NonceRecord, NonceStore};
use crate::config::DatabaseConfig;
use crate::error::WithdrawalResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Nonce store backed by a `nonce_records` table
pub struct PgNonceStore {
    pool: PgPool,
}

impl PgNonceStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> WithdrawalResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> WithdrawalResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nonce_records (
                account VARCHAR(42) PRIMARY KEY,
                chain_nonce BIGINT NOT NULL,
                local_nonce BIGINT NOT NULL,
                pending_nonces BIGINT[] NOT NULL DEFAULT '{}',
                gap_nonces BIGINT[] NOT NULL DEFAULT '{}',
                lock_token UUID,
                lock_expires_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK (local_nonce >= chain_nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_nonce_records_lock_expiry
            ON nonce_records (lock_expires_at)
            WHERE lock_token IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn to_db(values: &std::collections::BTreeSet<u64>) -> Vec<i64> {
    values.iter().map(|&n| n as i64).collect()
}

fn from_row(row: PgRow) -> NonceRecord {
    let pending: Vec<i64> = row.get("pending_nonces");
    let gaps: Vec<i64> = row.get("gap_nonces");

    NonceRecord {
        account: row.get("account"),
        chain_nonce: row.get::<i64, _>("chain_nonce") as u64,
        local_nonce: row.get::<i64, _>("local_nonce") as u64,
        pending_nonces: pending.into_iter().map(|n| n as u64).collect(),
        gap_nonces: gaps.into_iter().map(|n| n as u64).collect(),
        lock_token: row.get("lock_token"),
        lock_expires_at: row.get("lock_expires_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl NonceStore for PgNonceStore {
    async fn load(&self, account: &str) -> WithdrawalResult<Option<NonceRecord>> {
        let row = sqlx::query(
            r#"
            SELECT account, chain_nonce, local_nonce, pending_nonces, gap_nonces,
                   lock_token, lock_expires_at, updated_at
            FROM nonce_records
            WHERE account = $1
            "#,
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(from_row))
    }

    async fn insert_if_absent(&self, record: &NonceRecord) -> WithdrawalResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO nonce_records
                (account, chain_nonce, local_nonce, pending_nonces, gap_nonces, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account) DO NOTHING
            "#,
        )
        .bind(&record.account)
        .bind(record.chain_nonce as i64)
        .bind(record.local_nonce as i64)
        .bind(to_db(&record.pending_nonces))
        .bind(to_db(&record.gap_nonces))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_lock(
        &self,
        account: &str,
        token: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WithdrawalResult<bool> {
        // The row lock taken by UPDATE makes the availability check and the
        // write a single step; a concurrent loser re-evaluates the WHERE clause
        let result = sqlx::query(
            r#"
            UPDATE nonce_records
            SET lock_token = $2, lock_expires_at = $3, updated_at = $4
            WHERE account = $1
              AND (lock_token IS NULL OR lock_expires_at IS NULL OR lock_expires_at < $4)
            "#,
        )
        .bind(account)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, account: &str, token: Uuid) -> WithdrawalResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE nonce_records
            SET lock_token = NULL, lock_expires_at = NULL, updated_at = NOW()
            WHERE account = $1 AND lock_token = $2
            "#,
        )
        .bind(account)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_locked(
        &self,
        record: &NonceRecord,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> WithdrawalResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE nonce_records
            SET chain_nonce = $2, local_nonce = $3, pending_nonces = $4, gap_nonces = $5,
                updated_at = $7
            WHERE account = $1 AND lock_token = $6 AND lock_expires_at >= $7
            "#,
        )
        .bind(&record.account)
        .bind(record.chain_nonce as i64)
        .bind(record.local_nonce as i64)
        .bind(to_db(&record.pending_nonces))
        .bind(to_db(&record.gap_nonces))
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved nonce record for {}: local {}, {} pending",
            record.account,
            record.local_nonce,
            record.pending_nonces.len()
        );
        Ok(result.rows_affected() == 1)
    }

    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> WithdrawalResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE nonce_records
            SET lock_token = NULL, lock_expires_at = NULL, updated_at = $1
            WHERE lock_token IS NOT NULL
              AND (lock_expires_at IS NULL OR lock_expires_at < $1)
            RETURNING account
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("account")).collect())
    }

    async fn accounts(&self) -> WithdrawalResult<Vec<String>> {
        let rows = sqlx::query("SELECT account FROM nonce_records ORDER BY account")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.get("account")).collect())
    }

    async fn health_check(&self) -> WithdrawalResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
