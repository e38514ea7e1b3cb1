use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{CancelResponse, ErrorResponse, JobStatusResponse, SubmitJobRequest, SubmitJobResponse};
use crate::models::job::{AuthContext, Job, JobId};
use crate::models::status::JobStatus;
use crate::services::controller::SubmitError;

/// Error type shared by the JSON API handlers.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Submit(SubmitError),
    Forbidden,
    NotFound,
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        Self::Submit(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_failed", msg),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden", "Not authorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "Job not found".to_string()),
            ApiError::Submit(e) => {
                let status = match e {
                    SubmitError::InvalidJob(_) => StatusCode::BAD_REQUEST,
                    SubmitError::Unauthorized => StatusCode::FORBIDDEN,
                    SubmitError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                    SubmitError::CapacityExceeded | SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.reason(), e.to_string())
            }
        };
        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Bearer token from the `Authorization` header, passed through opaquely.
pub fn auth_context(headers: &HeaderMap) -> AuthContext {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    match token {
        Some(token) => AuthContext::with_token("bearer", token),
        None => AuthContext::new("anonymous"),
    }
}

/// POST /api/v1/jobs: Submit a portrait for verification.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    req.validate().map_err(|e| ApiError::Validation(e.to_string()))?;

    let job = Job::new(req.input_path, req.output_path, req.format, auth_context(&headers))
        .with_priority(req.priority)
        .with_options(req.options);

    let job_id = state.controller.submit_job(job).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            status: "queued".to_string(),
            message: "Portrait queued for verification".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: Check job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = JobId(job_id);
    let status = state.controller.get_processing_status(job_id);
    if matches!(status, JobStatus::NotFound) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(JobStatusResponse { job_id, status }))
}

/// DELETE /api/v1/jobs/{job_id}: Cancel a queued or active job.
pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Json<CancelResponse> {
    let job_id = JobId(job_id);
    let cancelled = state.controller.cancel_job(job_id, &auth_context(&headers));
    Json(CancelResponse { job_id, cancelled })
}
