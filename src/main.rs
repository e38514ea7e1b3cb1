use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use portrait_verify::app_state::{self, AppState};
use portrait_verify::config::AppConfig;
use portrait_verify::routes;

/// Time given to in-flight jobs after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing portrait-verify server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("verify_jobs_submitted_total", "Jobs admitted to the queue");
    metrics::describe_counter!("verify_jobs_completed_total", "Jobs that finished successfully");
    metrics::describe_counter!("verify_jobs_failed_total", "Jobs that failed or timed out");
    metrics::describe_counter!("verify_jobs_cancelled_total", "Jobs cancelled before finishing");
    metrics::describe_counter!("verify_admission_rejected_total", "Submissions rejected at admission, by reason");
    metrics::describe_gauge!("verify_queue_depth", "Jobs waiting for a worker");
    metrics::describe_gauge!("verify_active_jobs", "Jobs currently running");
    metrics::describe_histogram!("verify_processing_seconds", "Wall-clock time per finished job");
    metrics::describe_histogram!("verify_stage_seconds", "Time spent in each pipeline stage");

    tracing::info!(endpoint = %config.face_detector_url, "Initializing stage collaborators");
    let stages = app_state::production_stages(&config).expect("Failed to initialize face detector");

    let authorizer = app_state::authorizer(&config);
    let controller = app_state::build_controller(&config, stages, authorizer.clone())
        .expect("Failed to initialize controller");
    let dispatch = controller.start();

    let state = AppState::new(controller.clone(), authorizer);

    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .expect("Server error");

    let drained = controller.shutdown(SHUTDOWN_GRACE).await;
    if let Err(e) = dispatch.await {
        tracing::error!(error = %e, "Dispatch loop ended abnormally");
    }
    tracing::info!(drained, "Server stopped");
}
