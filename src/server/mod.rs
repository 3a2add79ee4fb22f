//! The HTTP surface (§7): a small `axum` router exposing the relay's
//! client-facing endpoints, grounded in the teacher's `server/mod.rs`
//! router construction and middleware stacking, generalized from the
//! identity-commitment routes to the relay's admission/ping/health/metrics
//! routes.

mod custom_middleware;
pub mod error;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use hyper::header::CONTENT_TYPE;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::admission::{PingResponse, RelayTransactionRequest, RelayTransactionResponse};
use crate::app::App;
use crate::keystore::SigningRole;
use crate::shutdown::Shutdown;

use self::error::Error;

#[derive(Debug, Deserialize)]
struct GetAddrQuery {
    #[allow(dead_code)]
    paymaster: Option<String>,
}

async fn relay(
    State(app): State<Arc<App>>,
    Json(request): Json<RelayTransactionRequest>,
) -> Result<Json<RelayTransactionResponse>, Error> {
    let response = app.admission.create_relay_transaction(request).await?;
    Ok(Json(response))
}

async fn get_addr(
    State(app): State<Arc<App>>,
    Query(_query): Query<GetAddrQuery>,
) -> Json<PingResponse> {
    Json(PingResponse {
        relay_worker_address: app.keystore.address(SigningRole::Worker),
        relay_manager_address: app.keystore.address(SigningRole::Manager),
        relay_hub_address: app.config.contracts.relay_hub_address,
        min_gas_price: app.reconciliation.current_gas_price(),
        max_acceptance_budget: ethers::types::U256::from(app.config.economics.max_acceptance_budget),
        chain_id: app.config.chain.chain_id,
        network_id: app.config.chain.network_id,
        ready: app.reconciliation.is_ready(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health(State(app): State<Arc<App>>) -> hyper::StatusCode {
    if app.reconciliation.is_ready() {
        hyper::StatusCode::OK
    } else {
        hyper::StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics() -> Result<Response, Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Error::Other(err.into()))?;

    Ok(Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
        .map_err(|err| Error::Other(err.into()))?)
}

fn router(app: Arc<App>, serve_timeout: Duration) -> Router {
    Router::new()
        .route("/relay", post(relay))
        .route("/getaddr", get(get_addr))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::new(serve_timeout))
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn(custom_middleware::logging_layer::middleware))
        .with_state(app)
}

/// # Errors
///
/// Returns `Err` if the configured listen address cannot be bound.
pub async fn run(app: Arc<App>, shutdown: Arc<Shutdown>) -> anyhow::Result<()> {
    let address: SocketAddr = app.config.server.listen_address;
    let serve_timeout = app.config.server.serve_timeout;

    info!(%address, "starting relay HTTP server");
    let listener = TcpListener::bind(address).await?;

    let router = router(app, serve_timeout);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.await_shutdown().await })
        .await?;

    Ok(())
}
