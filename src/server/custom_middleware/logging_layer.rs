//! Per-request structured logging, grounded in the teacher's
//! `custom_middleware/logging_layer.rs`, adapted from axum 0.6's
//! `Next<B>` to axum 0.7's single `Body` type.

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, warn, Instrument};

pub async fn middleware(request: Request<Body>, next: Next) -> Response {
    let uri_path = request.uri().path().to_string();
    let method = request.method().clone();
    let query = request.uri().query().map(ToString::to_string);

    let span = info_span!("request", %uri_path, %method, ?query);

    async {
        info!(%uri_path, %method, ?query, "processing request");

        let response = next.run(request).await;
        let status = response.status();

        if status.is_client_error() {
            warn!(%uri_path, %method, %status, "request rejected");
        } else if status.is_server_error() {
            tracing::error!(%uri_path, %method, %status, "request failed");
        } else {
            info!(%uri_path, %method, %status, "request completed");
        }

        response
    }
    .instrument(span)
    .await
}
