//! dchat.pro withdrawal service - nonce allocation and gas estimation
//!
//! Keeps per-account nonce bookkeeping in sync with the chain, sweeps locks
//! left behind by crashed workers and serves nonce and fee status over HTTP.

use anyhow::Result;
use ethers::types::Address;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, info_span, warn, Instrument};

use dchat_withdrawals::api::{self, AppState};
use dchat_withdrawals::chain::{ChainClient, ChainProvider};
use dchat_withdrawals::config::Settings;
use dchat_withdrawals::metrics::{self, MetricsServer};
use dchat_withdrawals::store::{MemoryNonceStore, NonceStore, PgNonceStore};
use dchat_withdrawals::tx::{GasEstimator, LockPolicy, NonceAllocator, WithdrawalSender};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting dchat withdrawal service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({}) as instance {}",
        settings.chain.name, settings.chain.chain_id, settings.service.instance_id
    );
    let span = info_span!("withdrawals", instance = %settings.service.instance_id);

    // Nonce store
    let store: Arc<dyn NonceStore> = if settings.database.url.is_empty() {
        warn!("Using in-memory nonce store");
        Arc::new(MemoryNonceStore::new())
    } else {
        let store = PgNonceStore::new(&settings.database).await?;
        info!("Database connection established");
        store.run_migrations().await?;
        Arc::new(store)
    };

    // Chain connection
    let chain: Arc<dyn ChainClient> = Arc::new(ChainProvider::new(settings.chain.clone())?);
    info!("Chain connection initialized");

    let allocator = Arc::new(NonceAllocator::new(
        chain.clone(),
        store,
        LockPolicy::from(&settings.service),
    ));
    let estimator = Arc::new(GasEstimator::new(
        chain.clone(),
        &settings.gas,
        &settings.chain,
    ));

    // Hot wallet is optional; without it the service only tracks nonces and quotes fees
    let sender = match WithdrawalSender::load_wallet(&settings.wallet) {
        Ok(wallet) => {
            let sender = WithdrawalSender::new(
                chain.clone(),
                allocator.clone(),
                estimator.clone(),
                wallet,
                &settings.service,
            );
            info!("Withdrawal wallet: {:#x}", sender.wallet_address());
            Some(sender)
        }
        Err(e) => {
            warn!("No withdrawal wallet loaded: {}", e);
            None
        }
    };

    let mut accounts = parse_accounts(&settings.accounts);
    if let Some(sender) = &sender {
        if !accounts.contains(&sender.wallet_address()) {
            accounts.push(sender.wallet_address());
        }
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            allocator: allocator.clone(),
            estimator: estimator.clone(),
            chain: chain.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
        .instrument(span.clone())
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(
            async move {
                if let Err(e) = server.run().await {
                    error!("Metrics server error: {}", e);
                }
            }
            .instrument(span.clone()),
        ))
    } else {
        None
    };

    // Stale lock sweeper
    let sweeper_handle = tokio::spawn({
        let allocator = allocator.clone();
        let interval = settings.service.lock_sweep_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                if let Err(e) = allocator.cleanup_expired_locks().await {
                    warn!("Lock sweep failed: {}", e);
                }
            }
        }
        .instrument(span.clone())
    });

    // Periodic nonce reconciliation
    let sync_handle = tokio::spawn({
        let allocator = allocator.clone();
        let interval = settings.service.nonce_sync_interval_secs;
        async move {
            loop {
                for (account, result) in allocator.sync_all(&accounts).await {
                    if let Err(e) = result {
                        warn!("Nonce sync failed for {:#x}: {}", account, e);
                    }
                }

                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
        .instrument(span.clone())
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let allocator = allocator.clone();
        let chain = chain.clone();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;

                if !chain.health_check().await {
                    warn!("Chain {} health check failed", chain.chain_id());
                    healthy = false;
                }

                if let Err(e) = allocator.store_health().await {
                    warn!("Nonce store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
        .instrument(span.clone())
    });

    info!("Withdrawal service is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    api_handle.abort();
    sweeper_handle.abort();
    sync_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Withdrawal service stopped");
    Ok(())
}

fn parse_accounts(raw: &[String]) -> Vec<Address> {
    raw.iter()
        .filter_map(|s| match Address::from_str(s) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Ignoring invalid account {}: {}", s, e);
                None
            }
        })
        .collect()
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,dchat_withdrawals=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
