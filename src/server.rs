//! Scrape endpoint
//!
//! `GET /metrics` renders the sink in the Prometheus text format,
//! `GET /health` answers as long as the process is up.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::MetricsSink;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(sink: Arc<MetricsSink>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/health", get(health_check))
        .with_state(sink)
}

async fn metrics_endpoint(State(sink): State<Arc<MetricsSink>>) -> Response {
    match sink.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {addr}"))
}

/// Serve on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    sink: Arc<MetricsSink>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Serving metrics");

    axum::serve(listener, router(sink))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Metrics server failed")
}
