use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::compliance::ComplianceOutcome;
use crate::models::issue::Issue;
use crate::models::job::JobId;

/// Wall-clock time spent in each stage of one iteration, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub detection_ms: f64,
    pub segmentation_ms: f64,
    pub quality_ms: f64,
    pub validation_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement_ms: Option<f64>,
}

/// Facts recorded for a single pass through the stage sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based iteration index.
    pub iteration: u32,
    pub face_found: bool,
    pub quality_score: f64,
    pub compliance_score: f64,
    pub issues: Vec<Issue>,
    /// Revision number of the image produced by enhancement in this iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_image: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations_applied: Vec<String>,
    pub timings: StageTimings,
    pub elapsed_ms: f64,
}

/// Why the refinement loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Quality and compliance both cleared their thresholds.
    Converged,
    /// Iteration budget spent without convergence.
    Exhausted,
    /// Enhancement had nothing applicable to the remaining issues.
    NoApplicableFix,
    /// The detector found no face.
    NoFace,
    /// The input could not be loaded or was unusable.
    InputRejected,
    /// A stage failed in a way the loop cannot recover from.
    StageFailure,
    /// Cancellation was observed between iterations.
    Cancelled,
    /// Processing exceeded its timeout.
    TimedOut,
    /// An unexpected error escaped the pipeline.
    ProcessingError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStats {
    pub iterations_run: u32,
    pub enhancement_calls: u32,
    pub operations_applied: Vec<String>,
}

/// Terminal artifact for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub job_id: JobId,
    pub success: bool,
    pub termination: Termination,
    pub total_time_ms: f64,
    pub iterations: Vec<IterationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_quality: Option<ComplianceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_compliance: Option<ComplianceOutcome>,
    pub issues: Vec<Issue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub stats: ReportStats,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingReport {
    /// Report for a job that never produced an iteration.
    pub fn failure(job_id: JobId, termination: Termination, issue: Issue, total_time_ms: f64) -> Self {
        Self {
            job_id,
            success: false,
            termination,
            total_time_ms,
            iterations: Vec::new(),
            final_quality: None,
            final_compliance: None,
            issues: vec![issue],
            signature: None,
            stats: ReportStats::default(),
            finished_at: Utc::now(),
        }
    }

    /// Human-readable reason for a failed report: the first blocking issue, else the first issue.
    pub fn failure_reason(&self) -> String {
        self.issues
            .iter()
            .find(|i| i.is_blocking())
            .or_else(|| self.issues.first())
            .map(|i| format!("{}: {}", i.code, i.message))
            .unwrap_or_else(|| format!("{:?}", self.termination))
    }

    /// Bytes covered by the security signature: the report serialised without its signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned)
    }
}
