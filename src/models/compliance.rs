use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::issue::{any_blocking, Issue};

/// Result of validating measured facts against a set of requirements.
///
/// Produced fresh on every iteration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    pub passed: bool,
    pub score: f64,
    pub requirements_met: BTreeMap<String, bool>,
    pub measurements: BTreeMap<String, f64>,
    pub issues: Vec<Issue>,
    pub timestamp: DateTime<Utc>,
}

impl ComplianceOutcome {
    /// Outcome for a stage that could not measure anything.
    pub fn failed_with(issue: Issue) -> Self {
        Self {
            passed: false,
            score: 0.0,
            requirements_met: BTreeMap::new(),
            measurements: BTreeMap::new(),
            issues: vec![issue],
            timestamp: Utc::now(),
        }
    }

    /// Builds an outcome from already-evaluated parts, deriving `passed` from issue severity.
    pub fn from_parts(
        score: f64,
        requirements_met: BTreeMap<String, bool>,
        measurements: BTreeMap<String, f64>,
        issues: Vec<Issue>,
    ) -> Self {
        Self {
            passed: !any_blocking(&issues),
            score: score.clamp(0.0, 1.0),
            requirements_met,
            measurements,
            issues,
            timestamp: Utc::now(),
        }
    }

    pub fn met_count(&self) -> usize {
        self.requirements_met.values().filter(|met| **met).count()
    }
}
