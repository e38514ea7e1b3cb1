use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{JobId, JobOptions, DEFAULT_PRIORITY};
use crate::models::status::JobStatus;

/// Request body for submitting a portrait for verification.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(length(min = 1, max = 4096))]
    pub input_path: String,

    #[garde(length(min = 1, max = 4096))]
    pub output_path: String,

    #[garde(length(min = 1, max = 64))]
    pub format: String,

    #[garde(range(min = 1, max = 10))]
    #[serde(default = "default_priority")]
    pub priority: u8,

    #[garde(skip)]
    #[serde(default)]
    pub options: JobOptions,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// Response after a job was admitted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConcurrencyRequest {
    #[garde(range(min = 1, max = 50))]
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConcurrencyResponse {
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub accepted: bool,
}

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
