use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::status::{HealthState, SystemSnapshot};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthState,
    pub version: String,
    pub back_pressure_active: bool,
    pub pending: usize,
    pub active: usize,
    pub system: SystemSnapshot,
    pub warnings: Vec<String>,
}

/// GET /health: controller health with resource readings.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue = state.controller.get_queue_status();

    let status_code = if queue.health.status == HealthState::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: queue.health.status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        back_pressure_active: queue.health.back_pressure_active,
        pending: queue.pending,
        active: queue.active,
        system: queue.system,
        warnings: queue.health.warnings,
    };

    (status_code, Json(response))
}
