use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Severity tier of a validation issue.
///
/// Only `Critical` and `Error` block success; `Warning` and `Info` are advisory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Whether an issue of this severity prevents a job from succeeding.
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Critical | Severity::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueCategory {
    FaceDetection,
    Geometry,
    Background,
    Quality,
    Format,
    Enhancement,
    Input,
    Output,
    Processing,
    Timeout,
}

/// A single finding produced by a pipeline stage or the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub code: String,
    pub message: String,
    pub auto_fixable: bool,
}

impl Issue {
    pub fn new(
        severity: Severity,
        category: IssueCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            code: code.into(),
            message: message.into(),
            auto_fixable: false,
        }
    }

    pub fn critical(category: IssueCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, category, code, message)
    }

    pub fn error(category: IssueCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, code, message)
    }

    pub fn warning(category: IssueCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, code, message)
    }

    pub fn fixable(mut self, auto_fixable: bool) -> Self {
        self.auto_fixable = auto_fixable;
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity.is_blocking()
    }
}

/// True when any issue in the slice blocks success.
pub fn any_blocking(issues: &[Issue]) -> bool {
    issues.iter().any(Issue::is_blocking)
}
