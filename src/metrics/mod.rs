//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation and release outcomes
//! - Lock contention and stale lock sweeps
//! - Fee estimation fallbacks
//! - Withdrawal submissions

use crate::error::{WithdrawalError, WithdrawalResult};
use crate::store::ReleaseOutcome;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, CounterVec, Encoder,
    Histogram, IntCounter, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Nonce metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "dchat_nonces_allocated_total",
        "Total nonces handed out",
        &["chain_id"]
    ).unwrap();

    pub static ref NONCES_RELEASED: CounterVec = register_counter_vec!(
        "dchat_nonces_released_total",
        "Total nonce releases by outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    pub static ref NONCE_DRIFT: CounterVec = register_counter_vec!(
        "dchat_nonce_drift_total",
        "Syncs that found the chain ahead of local bookkeeping",
        &["chain_id"]
    ).unwrap();

    // Lock metrics
    pub static ref LOCK_TIMEOUTS: IntCounter = register_int_counter!(
        "dchat_nonce_lock_timeouts_total",
        "Lock acquisitions that gave up"
    ).unwrap();

    pub static ref LOCKS_EXPIRED: IntCounter = register_int_counter!(
        "dchat_nonce_locks_expired_total",
        "Abandoned locks cleared by the sweeper"
    ).unwrap();

    pub static ref LOCK_WAIT: Histogram = register_histogram!(
        "dchat_nonce_lock_wait_seconds",
        "Time spent acquiring an account lock",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    // Fee metrics
    pub static ref FEE_FALLBACKS: CounterVec = register_counter_vec!(
        "dchat_fee_fallbacks_total",
        "Fee estimates served from cache or defaults",
        &["kind"]
    ).unwrap();

    // Withdrawal metrics
    pub static ref WITHDRAWALS_SUBMITTED: CounterVec = register_counter_vec!(
        "dchat_withdrawals_submitted_total",
        "Total withdrawals broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref WITHDRAWALS_FAILED: CounterVec = register_counter_vec!(
        "dchat_withdrawals_failed_total",
        "Total withdrawals that failed before broadcast completed",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: IntCounter = register_int_counter!(
        "dchat_health_check_success_total",
        "Total successful health checks"
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: IntCounter = register_int_counter!(
        "dchat_health_check_failure_total",
        "Total failed health checks"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> WithdrawalResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| WithdrawalError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| WithdrawalError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> WithdrawalResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| WithdrawalError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| WithdrawalError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_nonce_allocated(chain_id: u64) {
    NONCES_ALLOCATED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_nonce_released(chain_id: u64, outcome: ReleaseOutcome) {
    NONCES_RELEASED
        .with_label_values(&[&chain_id.to_string(), outcome.as_str()])
        .inc();
}

pub fn record_nonce_drift(chain_id: u64) {
    NONCE_DRIFT.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_lock_timeout() {
    LOCK_TIMEOUTS.inc();
}

pub fn record_locks_expired(count: usize) {
    LOCKS_EXPIRED.inc_by(count as u64);
}

pub fn record_lock_wait(seconds: f64) {
    LOCK_WAIT.observe(seconds);
}

pub fn record_fee_fallback(kind: &str) {
    FEE_FALLBACKS.with_label_values(&[kind]).inc();
}

pub fn record_withdrawal_submitted(chain_id: u64) {
    WITHDRAWALS_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_withdrawal_failed(chain_id: u64) {
    WITHDRAWALS_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.inc();
}
