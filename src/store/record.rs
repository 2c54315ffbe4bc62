//! Per-account nonce bookkeeping
//!
//! All mutations here are pure; the allocator applies them while holding the
//! account lock and persists the result through a [`NonceStore`](super::NonceStore).

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Storage key for an account: lowercase `0x`-prefixed hex
pub fn account_key(account: Address) -> String {
    format!("{:#x}", account)
}

/// Persistent nonce state of one sending account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceRecord {
    pub account: String,
    /// Last transaction count observed on chain
    pub chain_nonce: u64,
    /// Next nonce to hand out
    pub local_nonce: u64,
    /// Reserved and not yet released
    pub pending_nonces: BTreeSet<u64>,
    /// Released as failed below a still-pending nonce, awaiting resync
    pub gap_nonces: BTreeSet<u64>,
    pub lock_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// What `release` did with a nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Used on chain
    Consumed,
    /// Topmost reservation rolled back; `local_nonce` decremented
    Reclaimed,
    /// Rolled back below another reservation; recorded as a gap
    Gap,
    /// Not currently reserved (already released or swept by sync)
    NotPending,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOutcome::Consumed => "consumed",
            ReleaseOutcome::Reclaimed => "reclaimed",
            ReleaseOutcome::Gap => "gap",
            ReleaseOutcome::NotPending => "not_pending",
        }
    }
}

/// Result of reconciling a record with the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account: String,
    pub chain_nonce: u64,
    pub local_nonce: u64,
    /// How far the chain had advanced past local bookkeeping (external sends)
    pub drift: u64,
    /// Pending reservations dropped because the chain moved past them
    pub cleared_pending: usize,
    /// Whether outstanding gaps were reclaimed by rewinding `local_nonce`
    pub rewound: bool,
}

impl NonceRecord {
    /// Fresh record seeded from the network
    pub fn seeded(account: String, chain_nonce: u64, now: DateTime<Utc>) -> Self {
        Self {
            account,
            chain_nonce,
            local_nonce: chain_nonce,
            pending_nonces: BTreeSet::new(),
            gap_nonces: BTreeSet::new(),
            lock_token: None,
            lock_expires_at: None,
            updated_at: now,
        }
    }

    /// Whether a new holder may take the lock at `now`
    pub fn lock_available(&self, now: DateTime<Utc>) -> bool {
        match (self.lock_token, self.lock_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at < now,
            (Some(_), None) => true,
        }
    }

    /// Whether `token` holds a live lock at `now`
    pub fn is_held_by(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        self.lock_token == Some(token) && self.lock_expires_at.map_or(false, |at| at >= now)
    }

    /// Hand out the next nonce and mark it pending
    pub fn reserve_next(&mut self) -> u64 {
        let nonce = self.local_nonce;
        self.pending_nonces.insert(nonce);
        self.local_nonce += 1;
        nonce
    }

    /// Finish a reservation
    pub fn release(&mut self, nonce: u64, success: bool) -> ReleaseOutcome {
        if !self.pending_nonces.remove(&nonce) {
            return ReleaseOutcome::NotPending;
        }

        if success {
            return ReleaseOutcome::Consumed;
        }

        let is_topmost = nonce + 1 == self.local_nonce
            && self.pending_nonces.last().map_or(true, |&max| max < nonce);

        if is_topmost {
            self.local_nonce = nonce;
            self.gap_nonces.remove(&nonce);
            ReleaseOutcome::Reclaimed
        } else {
            self.gap_nonces.insert(nonce);
            ReleaseOutcome::Gap
        }
    }

    /// Fold an observed on-chain transaction count into the record
    pub fn reconcile(&mut self, chain_nonce: u64) -> SyncReport {
        let drift = chain_nonce.saturating_sub(self.local_nonce);

        self.chain_nonce = chain_nonce;
        if chain_nonce > self.local_nonce {
            self.local_nonce = chain_nonce;
        }

        let before = self.pending_nonces.len();
        self.pending_nonces = self.pending_nonces.split_off(&chain_nonce);
        let cleared_pending = before - self.pending_nonces.len();
        self.gap_nonces = self.gap_nonces.split_off(&chain_nonce);

        // Every slot above the chain nonce was rolled back and nothing is in flight
        let outstanding = self.local_nonce - self.chain_nonce;
        let rewound = outstanding > 0
            && self.pending_nonces.is_empty()
            && self.gap_nonces.len() as u64 == outstanding;
        if rewound {
            self.local_nonce = self.chain_nonce;
            self.gap_nonces.clear();
        }

        SyncReport {
            account: self.account.clone(),
            chain_nonce: self.chain_nonce,
            local_nonce: self.local_nonce,
            drift,
            cleared_pending,
            rewound,
        }
    }

    /// Check the documented invariants
    pub fn is_consistent(&self) -> bool {
        self.local_nonce >= self.chain_nonce
            && self
                .pending_nonces
                .iter()
                .all(|n| (self.chain_nonce..self.local_nonce).contains(n))
            && self.pending_nonces.is_disjoint(&self.gap_nonces)
    }
}
