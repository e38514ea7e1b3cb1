//! Aggregation of requirement checks into a [`ComplianceOutcome`].
//!
//! Severity policy for a failed check:
//! - primary checks: landing further outside the band than its half-width
//!   is `Critical`, otherwise `Error`;
//! - secondary (uniformity, cosmetic) checks: `Warning`;
//! - informational (compression) checks: `Info`.
//!
//! Bands are inclusive: a measurement exactly on `min` or `max` passes.

use std::collections::BTreeMap;

use crate::models::compliance::ComplianceOutcome;
use crate::models::format::Band;
use crate::models::issue::{Issue, IssueCategory, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckClass {
    Primary,
    Secondary,
    Informational,
}

/// One named requirement with its measured value.
#[derive(Debug, Clone, PartialEq)]
pub struct RequirementCheck {
    pub name: String,
    pub label: String,
    pub code: String,
    pub category: IssueCategory,
    pub class: CheckClass,
    pub band: Band,
    pub measured: f64,
    pub auto_fixable: bool,
}

impl RequirementCheck {
    pub fn new(
        class: CheckClass,
        name: impl Into<String>,
        category: IssueCategory,
        band: Band,
        measured: f64,
    ) -> Self {
        let name = name.into();
        Self {
            label: name.replace('_', " "),
            code: format!("{}_NON_COMPLIANT", name.to_uppercase()),
            name,
            category,
            class,
            band,
            measured,
            auto_fixable: false,
        }
    }

    pub fn primary(name: impl Into<String>, category: IssueCategory, band: Band, measured: f64) -> Self {
        Self::new(CheckClass::Primary, name, category, band, measured)
    }

    pub fn secondary(name: impl Into<String>, category: IssueCategory, band: Band, measured: f64) -> Self {
        Self::new(CheckClass::Secondary, name, category, band, measured)
    }

    pub fn informational(name: impl Into<String>, category: IssueCategory, band: Band, measured: f64) -> Self {
        Self::new(CheckClass::Informational, name, category, band, measured)
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn fixable(mut self) -> Self {
        self.auto_fixable = true;
        self
    }

    pub fn passed(&self) -> bool {
        classify(self.class, self.band, self.measured).is_none()
    }

    fn issue(&self) -> Option<Issue> {
        let severity = classify(self.class, self.band, self.measured)?;
        let message = format!(
            "{} {:.3} outside {:.3}..={:.3}",
            self.label, self.measured, self.band.min, self.band.max
        );
        Some(Issue::new(severity, self.category, self.code.clone(), message).fixable(self.auto_fixable))
    }
}

/// Severity of a measurement, or `None` when it lies within the band.
pub fn classify(class: CheckClass, band: Band, measured: f64) -> Option<Severity> {
    if band.contains(measured) {
        return None;
    }
    Some(match class {
        CheckClass::Primary if band.excess(measured) > band.half_width() => Severity::Critical,
        CheckClass::Primary => Severity::Error,
        CheckClass::Secondary => Severity::Warning,
        CheckClass::Informational => Severity::Info,
    })
}

/// Collects checks, extra measurements and pre-made issues, then scores them.
#[derive(Debug, Default)]
pub struct ComplianceScorer {
    checks: Vec<RequirementCheck>,
    flags: Vec<(String, bool)>,
    measurements: BTreeMap<String, f64>,
    issues: Vec<Issue>,
}

impl ComplianceScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, check: RequirementCheck) -> &mut Self {
        self.checks.push(check);
        self
    }

    /// A pass/fail requirement without a tolerance band; `issue` is recorded when it fails.
    pub fn flag(&mut self, name: impl Into<String>, passed: bool, issue: Issue) -> &mut Self {
        if !passed {
            self.issues.push(issue);
        }
        self.flags.push((name.into(), passed));
        self
    }

    /// Record a measurement that does not take part in scoring.
    pub fn measure(&mut self, name: impl Into<String>, value: f64) -> &mut Self {
        self.measurements.insert(name.into(), value);
        self
    }

    /// Attach an issue that was not derived from a band check.
    pub fn issue(&mut self, issue: Issue) -> &mut Self {
        self.issues.push(issue);
        self
    }

    /// `score = met / total` (0 when there are no checks); `passed` when no issue is blocking.
    pub fn finish(self) -> ComplianceOutcome {
        let mut requirements_met = BTreeMap::new();
        let mut measurements = self.measurements;
        let mut issues = self.issues;

        for (name, passed) in self.flags {
            requirements_met.insert(name, passed);
        }
        for check in &self.checks {
            requirements_met.insert(check.name.clone(), check.passed());
            measurements.insert(check.name.clone(), check.measured);
            if let Some(issue) = check.issue() {
                issues.push(issue);
            }
        }

        let total = requirements_met.len();
        let met = requirements_met.values().filter(|m| **m).count();
        let score = if total == 0 { 0.0 } else { met as f64 / total as f64 };

        ComplianceOutcome::from_parts(score, requirements_met, measurements, issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::format::FormatRules;

    const ROTATION: Band = Band::between(-2.0, 2.0);

    #[test]
    fn test_boundary_is_inclusive() {
        assert_eq!(classify(CheckClass::Primary, ROTATION, 2.0), None);
        assert_eq!(classify(CheckClass::Primary, ROTATION, -2.0), None);
    }

    #[test]
    fn test_builtin_band_edges_pass() {
        for rules in [FormatRules::icao(), FormatRules::us_passport()] {
            let bands = [
                ("face_height_ratio", rules.face_height_ratio),
                ("eye_line_ratio", rules.eye_line_ratio),
                ("center_offset", rules.center_offset),
                ("head_rotation_deg", rules.head_rotation_deg),
                ("background_distance", rules.background_distance),
                ("face_quality", rules.face_quality),
            ];
            for (name, band) in bands {
                for edge in [band.min, band.max] {
                    assert_eq!(
                        classify(CheckClass::Primary, band, edge),
                        None,
                        "{} {name} rejected its own edge {edge}",
                        rules.id
                    );
                }
            }
        }
    }

    #[test]
    fn test_icao_literal_edges_pass() {
        let icao = FormatRules::icao();
        assert_eq!(classify(CheckClass::Primary, icao.face_height_ratio, 0.62), None);
        assert_eq!(classify(CheckClass::Primary, icao.face_height_ratio, 0.69), None);
        assert_eq!(classify(CheckClass::Primary, icao.eye_line_ratio, 0.33), None);
        assert_eq!(classify(CheckClass::Primary, icao.eye_line_ratio, 0.36), None);
        assert_eq!(
            classify(CheckClass::Primary, icao.eye_line_ratio, 0.361),
            Some(Severity::Error)
        );
    }

    #[test]
    fn test_just_beyond_tolerance_is_error() {
        let measured = 2.0 + 1e-9;
        assert_eq!(classify(CheckClass::Primary, ROTATION, measured), Some(Severity::Error));
    }

    #[test]
    fn test_twice_tolerance_is_still_error() {
        assert_eq!(classify(CheckClass::Primary, ROTATION, 4.0), Some(Severity::Error));
        assert_eq!(classify(CheckClass::Primary, ROTATION, 4.5), Some(Severity::Critical));
    }

    #[test]
    fn test_secondary_and_informational_tiers() {
        assert_eq!(classify(CheckClass::Secondary, ROTATION, 100.0), Some(Severity::Warning));
        assert_eq!(classify(CheckClass::Informational, ROTATION, 100.0), Some(Severity::Info));
    }

    #[test]
    fn test_score_and_pass() {
        let mut scorer = ComplianceScorer::new();
        scorer
            .check(RequirementCheck::primary("head_rotation", IssueCategory::Geometry, ROTATION, 1.0))
            .check(RequirementCheck::secondary(
                "background_uniformity",
                IssueCategory::Background,
                Band::new(1.0, 0.15),
                0.5,
            ))
            .check(RequirementCheck::informational(
                "compression_artifacts",
                IssueCategory::Quality,
                Band::at_most(0.1),
                0.3,
            ))
            .measure("image_width", 600.0);
        let outcome = scorer.finish();

        assert!((outcome.score - 1.0 / 3.0).abs() < 1e-12);
        assert!(outcome.passed, "warnings and info must not block");
        assert_eq!(outcome.issues.len(), 2);
        assert_eq!(outcome.measurements.get("image_width"), Some(&600.0));
        assert_eq!(outcome.requirements_met.get("head_rotation"), Some(&true));
    }

    #[test]
    fn test_error_blocks_pass() {
        let mut scorer = ComplianceScorer::new();
        scorer.check(
            RequirementCheck::primary("head_rotation", IssueCategory::Geometry, ROTATION, 3.0)
                .code("HEAD_ROTATION")
                .fixable(),
        );
        let outcome = scorer.finish();
        assert!(!outcome.passed);
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.issues[0].code, "HEAD_ROTATION");
        assert!(outcome.issues[0].auto_fixable);
    }

    #[test]
    fn test_no_checks_scores_zero() {
        assert_eq!(ComplianceScorer::new().finish().score, 0.0);
    }
}
