use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use serve_metrics::setup_metrics_routes;

pub async fn index() -> &'static str {
    "stream ingest service"
}

/// Health routes plus the prometheus endpoint.
pub fn router() -> Result<Router> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    setup_metrics_routes(router).context("Failed to install prometheus recorder")
}
