use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::api::{ConcurrencyRequest, ConcurrencyResponse, ShutdownResponse};
use crate::models::status::QueueStatus;
use crate::routes::jobs::{auth_context, ApiError};
use crate::services::security::{ACTION_ADMIN, RESOURCE_SYSTEM};

/// GET /api/v1/queue: Queue depth, statistics and system health.
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.controller.get_queue_status())
}

/// PUT /api/v1/concurrency: Change the worker limit for future dispatches.
pub async fn set_concurrency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConcurrencyRequest>,
) -> Result<Json<ConcurrencyResponse>, ApiError> {
    if !state
        .authorizer
        .authorize(&auth_context(&headers), RESOURCE_SYSTEM, ACTION_ADMIN)
    {
        return Err(ApiError::Forbidden);
    }
    req.validate().map_err(|e| ApiError::Validation(e.to_string()))?;
    state
        .controller
        .set_concurrency_limit(req.limit)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(Json(ConcurrencyResponse {
        max_concurrent_jobs: req.limit,
    }))
}

/// POST /api/v1/shutdown: Emergency stop: cancel everything, refuse new work.
pub async fn emergency_shutdown(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> (StatusCode, Json<ShutdownResponse>) {
    let accepted = state.controller.emergency_shutdown(&auth_context(&headers));
    let status = if accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::FORBIDDEN
    };
    (status, Json(ShutdownResponse { accepted }))
}
