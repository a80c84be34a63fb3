//! HTTP endpoint exposing Prometheus metrics and a liveness probe.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry)
}

async fn render(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    let mut body = String::new();
    TextEncoder::new()
        .encode_utf8(&registry.gather(), &mut body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(body)
}

/// Serves `/metrics` and `/healthz` on `addr` until the task is dropped.
pub async fn serve(addr: SocketAddr, registry: Registry) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("failed to bind to {}: {}", addr, e)))?;
    info!("Serving metrics on {}", addr);

    axum::serve(listener, router(registry))
        .await
        .map_err(|e| ControllerError::Metrics(format!("metrics server error: {}", e)))
}
