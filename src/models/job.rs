use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lowest and highest accepted job priority. Higher values dequeue first.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller identity passed through to the authorization check, the signer and
/// the audit sink. The controller never looks inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub subject: String,
    pub token: Option<String>,
}

impl AuthContext {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            token: None,
        }
    }

    pub fn with_token(subject: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            token: Some(token.into()),
        }
    }
}

/// Per-job processing knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lowers the iteration budget for this job. Never raises it above the pipeline maximum.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Background colour used when the enhancer replaces the background.
    #[serde(default)]
    pub background_color: Option<[u8; 3]>,
    /// Run validation only; never call the enhancement engine.
    #[serde(default)]
    pub validate_only: bool,
}

/// One unit of work: process one input image under one format's rules.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub format_id: String,
    pub options: JobOptions,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub context: AuthContext,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        format_id: impl Into<String>,
        context: AuthContext,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            input_path: input_path.into(),
            output_path: output_path.into(),
            format_id: format_id.into(),
            options: JobOptions::default(),
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            context,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Requests cooperative cancellation. Checked between pipeline iterations.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Where a job currently lives in the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let job = Job::new("in.png", "out.png", "icao", AuthContext::new("tester"));
        let copy = job.clone();
        assert!(!copy.is_cancelled());
        job.cancel();
        assert!(copy.is_cancelled());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }
}
