//! HTTP API for health checks, nonce status and fee quotes

use crate::chain::ChainClient;
use crate::config::ApiConfig;
use crate::error::{WithdrawalError, WithdrawalResult};
use crate::store::{NonceRecord, SyncReport};
use crate::tx::{FeeQuote, FeeStrategy, GasEstimator, NonceAllocator, TotalCost};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<NonceAllocator>,
    pub estimator: Arc<GasEstimator>,
    pub chain: Arc<dyn ChainClient>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/accounts/:account/nonce", get(get_nonce_status))
        .route("/accounts/:account/sync", post(sync_account))
        .route("/fees", get(get_fees))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> WithdrawalResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WithdrawalError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| WithdrawalError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - nonce store and chain RPC
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.allocator.store_health().await.is_ok();
    let chain_ok = state.chain.health_check().await;

    let status = if store_ok && chain_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: store_ok && chain_ok,
            store: store_ok,
            chain: ChainHealth {
                chain_id: state.chain.chain_id(),
                healthy: chain_ok,
            },
        }),
    )
}

/// Current nonce bookkeeping for an account
async fn get_nonce_status(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<NonceRecord>, ApiError> {
    let address = parse_account(&account)?;

    match state.allocator.record(address).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound(format!("No nonce record for {}", account))),
    }
}

/// Reconcile an account against the chain now
async fn sync_account(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<SyncReport>, ApiError> {
    let address = parse_account(&account)?;
    let report = state.allocator.sync_nonce(address).await?;
    Ok(Json(report))
}

/// Fee quote and worst-case native transfer cost for a strategy
async fn get_fees(
    State(state): State<AppState>,
    Query(query): Query<FeeQuery>,
) -> Result<Json<FeesResponse>, ApiError> {
    let strategy = match query.strategy {
        Some(s) => s
            .parse::<FeeStrategy>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => FeeStrategy::default(),
    };

    let quote = state.estimator.get_fee_quote(strategy).await;
    let total_cost = state.estimator.estimate_total_cost(quote.gas_limit, &quote);

    Ok(Json(FeesResponse {
        chain_id: state.chain.chain_id(),
        quote,
        total_cost,
    }))
}

fn parse_account(account: &str) -> Result<Address, ApiError> {
    account
        .parse::<Address>()
        .map_err(|_| ApiError::BadRequest(format!("Invalid account address: {}", account)))
}

/// Errors surfaced to API callers
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Service(WithdrawalError),
}

impl From<WithdrawalError> for ApiError {
    fn from(e: WithdrawalError) -> Self {
        ApiError::Service(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Service(e) => {
                let status = if e.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, e.user_message().to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// Request and response types

#[derive(Deserialize)]
struct FeeQuery {
    strategy: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chain: ChainHealth,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct FeesResponse {
    chain_id: u64,
    quote: FeeQuote,
    total_cost: TotalCost,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedChain;
    use crate::config::{ChainConfig, FeeModel, GasConfig};
    use crate::store::MemoryNonceStore;
    use crate::tx::LockPolicy;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const ACCOUNT: &str = "0x00000000000000000000000000000000000000aa";

    fn app(chain: Arc<ScriptedChain>) -> Router {
        let chain_config = ChainConfig {
            chain_id: chain.chain_id,
            name: "sepolia".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            fee_model: FeeModel::Auto,
            max_gas_price_gwei: 1_000,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
        };

        let allocator = Arc::new(NonceAllocator::new(
            chain.clone(),
            Arc::new(MemoryNonceStore::new()),
            LockPolicy::default(),
        ));
        let estimator = Arc::new(GasEstimator::new(
            chain.clone(),
            &GasConfig::default(),
            &chain_config,
        ));

        router(AppState {
            allocator,
            estimator,
            chain,
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let response = app(Arc::new(ScriptedChain::new(0)))
            .oneshot(get("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_reports_unhealthy_chain() {
        let chain = Arc::new(ScriptedChain::new(0));
        chain.set_failing(true);

        let response = app(chain).oneshot(get("/ready")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["store"], true);
        assert_eq!(body["chain"]["healthy"], false);
    }

    #[tokio::test]
    async fn nonce_status_after_sync() {
        let app = app(Arc::new(ScriptedChain::new(7)));

        let missing = app
            .clone()
            .oneshot(get(&format!("/accounts/{}/nonce", ACCOUNT)))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let sync = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/accounts/{}/sync", ACCOUNT))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(sync.status(), StatusCode::OK);

        let status = app
            .oneshot(get(&format!("/accounts/{}/nonce", ACCOUNT)))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let body = body_json(status).await;
        assert_eq!(body["chain_nonce"], 7);
        assert_eq!(body["local_nonce"], 7);
    }

    #[tokio::test]
    async fn rejects_bad_account_and_strategy() {
        let app = app(Arc::new(ScriptedChain::new(0)));

        let account = app
            .clone()
            .oneshot(get("/accounts/not-an-address/nonce"))
            .await
            .unwrap();
        assert_eq!(account.status(), StatusCode::BAD_REQUEST);

        let fees = app.oneshot(get("/fees?strategy=warp")).await.unwrap();
        assert_eq!(fees.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fees_quote_fee_market() {
        let response = app(Arc::new(ScriptedChain::new(0)))
            .oneshot(get("/fees?strategy=fast"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["quote"]["strategy"], "fast");
        assert_eq!(body["quote"]["is_fee_market"], true);
        // 21000 * (2 * 10 + 3) gwei
        let amount = body["total_cost"]["native_amount"].as_str().unwrap();
        assert!(amount.starts_with("0.000483"), "unexpected cost {}", amount);
    }
}
