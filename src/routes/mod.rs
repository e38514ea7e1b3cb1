use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod admin;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Request bodies are small JSON documents; images are referenced by path.
const BODY_LIMIT: usize = 64 * 1024;

pub fn router(state: AppState, prometheus_handle: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job_status).delete(jobs::cancel_job),
        )
        .route("/api/v1/queue", get(admin::queue_status))
        .route("/api/v1/concurrency", put(admin::set_concurrency))
        .route("/api/v1/shutdown", post(admin::emergency_shutdown))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
}
