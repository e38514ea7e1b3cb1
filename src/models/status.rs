use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::issue::Issue;
use crate::models::job::JobId;

/// Answer to `get_processing_status`. ETA and progress are heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued {
        /// 1-based position in dispatch order.
        position: usize,
        eta_secs: f64,
        submitted_at: DateTime<Utc>,
    },
    Active {
        /// Estimated fraction complete in `0.0..=0.99`.
        progress: f64,
        eta_secs: f64,
        iteration: u32,
        started_at: DateTime<Utc>,
    },
    Completed {
        summary: CompletionSummary,
    },
    Failed {
        reason: String,
        issues: Vec<Issue>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
    NotFound,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued { .. } => "queued",
            JobStatus::Active { .. } => "active",
            JobStatus::Completed { .. } => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled { .. } => "cancelled",
            JobStatus::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub job_id: JobId,
    pub success: bool,
    pub total_time_ms: f64,
    pub iterations: u32,
    pub issues: Vec<Issue>,
    pub finished_at: DateTime<Utc>,
}

/// Point-in-time resource utilisation, all values in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub available_memory_gb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    Healthy,
    HighLoad,
    Overloaded,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub back_pressure_active: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub average_processing_ms: f64,
    pub average_iterations: f64,
    pub throughput_per_minute: f64,
    pub success_rate: f64,
    pub uptime_secs: f64,
}

/// Answer to `get_queue_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub timestamp: DateTime<Utc>,
    pub pending: usize,
    pub active: usize,
    pub max_queue_size: usize,
    pub max_concurrent_jobs: usize,
    pub queue_utilization: f64,
    pub stats: ProcessingStats,
    pub system: SystemSnapshot,
    pub health: HealthReport,
}
