//! Iterative refinement loop: detect, segment, analyse, validate, then either
//! stop on convergence or enhance and go round again.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::models::compliance::ComplianceOutcome;
use crate::models::format::FormatRules;
use crate::models::issue::{any_blocking, Issue, IssueCategory, Severity};
use crate::models::job::Job;
use crate::models::report::{IterationResult, ProcessingReport, ReportStats, StageTimings, Termination};
use crate::services::stages::{
    BackgroundProcessor, ComplianceValidator, EnhancementEngine, FaceDetector, QualityAnalyzer, Stage, StageError,
};

pub const CODE_IMAGE_LOAD_FAILED: &str = "IMAGE_LOAD_FAILED";
pub const CODE_IMAGE_TOO_SMALL: &str = "IMAGE_TOO_SMALL";
pub const CODE_SAVE_FAILED: &str = "SAVE_FAILED";
pub const CODE_NO_FACE_FOUND: &str = "NO_FACE_FOUND";
pub const CODE_CANCELLED: &str = "JOB_CANCELLED";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_iterations: u32,
    pub quality_threshold: f64,
    pub compliance_threshold: f64,
    /// Report success when the budget runs out with only Warning/Info issues left.
    pub pass_on_exhaustion: bool,
    /// Inputs smaller than this on either side are rejected.
    pub min_image_dimension: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            quality_threshold: 0.95,
            compliance_threshold: 0.95,
            pass_on_exhaustion: true,
            min_image_dimension: 100,
        }
    }
}

/// The five stage collaborators, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn FaceDetector>,
    pub background: Arc<dyn BackgroundProcessor>,
    pub quality: Arc<dyn QualityAnalyzer>,
    pub enhancer: Arc<dyn EnhancementEngine>,
    pub validator: Arc<dyn ComplianceValidator>,
}

/// Live progress of one job, written by the worker and read by status queries.
#[derive(Debug, Default)]
pub struct JobProgress {
    iteration: AtomicU32,
    budget: AtomicU32,
}

impl JobProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Heuristic completion fraction, never reaching 1.0 while running.
    pub fn fraction(&self) -> f64 {
        let budget = self.budget.load(Ordering::Acquire);
        let iteration = self.iteration();
        if budget == 0 || iteration == 0 {
            return 0.0;
        }
        ((iteration as f64 - 0.5) / budget as f64).clamp(0.0, 0.99)
    }

    fn begin(&self, budget: u32) {
        self.budget.store(budget, Ordering::Release);
    }

    fn enter(&self, iteration: u32) {
        self.iteration.store(iteration, Ordering::Release);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to load image: {0}")]
    Load(#[source] image::ImageError),

    #[error("Image {width}x{height} is smaller than the {min}px minimum")]
    TooSmall { width: u32, height: u32, min: u32 },

    #[error("Failed to create output directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to save image: {0}")]
    Save(#[source] image::ImageError),
}

pub fn load_image(path: &Path, min_dimension: u32) -> Result<DynamicImage, ImageError> {
    let image = image::open(path).map_err(ImageError::Load)?;
    if image.width() < min_dimension || image.height() < min_dimension {
        return Err(ImageError::TooSmall {
            width: image.width(),
            height: image.height(),
            min: min_dimension,
        });
    }
    Ok(image)
}

pub fn save_image(image: &DynamicImage, path: &Path) -> Result<(), ImageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path).map_err(ImageError::Save)
}

/// What the loop produced, before image output and report assembly.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub termination: Termination,
    pub iterations: Vec<IterationResult>,
    pub final_quality: Option<ComplianceOutcome>,
    pub final_compliance: Option<ComplianceOutcome>,
    pub image: DynamicImage,
    pub stats: ReportStats,
}

impl LoopOutcome {
    fn last_issues(&self) -> Vec<Issue> {
        self.iterations.last().map(|it| it.issues.clone()).unwrap_or_default()
    }
}

/// How a single iteration ended.
enum Step {
    Next(DynamicImage),
    Stop(Termination),
}

pub struct PipelineStageRunner {
    stages: Collaborators,
    config: PipelineConfig,
}

impl PipelineStageRunner {
    pub fn new(stages: Collaborators, config: PipelineConfig) -> Self {
        Self { stages, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Iteration budget for a job: the job may lower the configured maximum, never raise it.
    pub fn budget_for(&self, job: &Job) -> u32 {
        let max = self.config.max_iterations.max(1);
        if job.options.validate_only {
            return 1;
        }
        job.options.max_iterations.map_or(max, |n| n.clamp(1, max))
    }

    /// Run a job end to end: load, refine, save, and assemble the report.
    /// Never fails; every problem becomes an issue on the returned report.
    pub fn process(&self, job: &Job, rules: &FormatRules, progress: &JobProgress) -> ProcessingReport {
        let started = Instant::now();

        let image = match load_image(&job.input_path, self.config.min_image_dimension) {
            Ok(image) => image,
            Err(e) => {
                let code = match e {
                    ImageError::TooSmall { .. } => CODE_IMAGE_TOO_SMALL,
                    _ => CODE_IMAGE_LOAD_FAILED,
                };
                tracing::warn!(job_id = %job.job_id, error = %e, "Input rejected");
                return ProcessingReport::failure(
                    job.job_id,
                    Termination::InputRejected,
                    Issue::critical(IssueCategory::Input, code, e.to_string()),
                    elapsed_ms(started),
                );
            }
        };

        let outcome = self.run_iterations(job, image, rules, progress);
        let mut issues = outcome.last_issues();
        let mut success = self.is_success(&outcome);

        let produces_output = matches!(
            outcome.termination,
            Termination::Converged | Termination::Exhausted | Termination::NoApplicableFix
        );
        if produces_output && !job.options.validate_only {
            if let Err(e) = save_image(&outcome.image, &job.output_path) {
                tracing::error!(job_id = %job.job_id, path = %job.output_path.display(), error = %e, "Save failed");
                issues.push(Issue::error(IssueCategory::Output, CODE_SAVE_FAILED, e.to_string()));
                success = false;
            }
        }

        let report = ProcessingReport {
            job_id: job.job_id,
            success,
            termination: outcome.termination,
            total_time_ms: elapsed_ms(started),
            iterations: outcome.iterations,
            final_quality: outcome.final_quality,
            final_compliance: outcome.final_compliance,
            issues,
            signature: None,
            stats: outcome.stats,
            finished_at: Utc::now(),
        };

        tracing::info!(
            job_id = %job.job_id,
            success = report.success,
            termination = ?report.termination,
            iterations = report.stats.iterations_run,
            total_ms = report.total_time_ms,
            "Pipeline finished"
        );
        report
    }

    /// Converged always succeeds. Running out of budget, or of applicable fixes,
    /// succeeds only under `pass_on_exhaustion` when the last iteration produced
    /// both outcomes and left no Critical/Error issue.
    pub fn is_success(&self, outcome: &LoopOutcome) -> bool {
        match outcome.termination {
            Termination::Converged => true,
            Termination::Exhausted | Termination::NoApplicableFix => {
                self.config.pass_on_exhaustion
                    && outcome.final_quality.is_some()
                    && outcome.final_compliance.is_some()
                    && !any_blocking(&outcome.last_issues())
            }
            _ => false,
        }
    }

    pub fn run_iterations(
        &self,
        job: &Job,
        image: DynamicImage,
        rules: &FormatRules,
        progress: &JobProgress,
    ) -> LoopOutcome {
        let budget = self.budget_for(job);
        progress.begin(budget);

        let mut outcome = LoopOutcome {
            termination: Termination::Exhausted,
            iterations: Vec::with_capacity(budget as usize),
            final_quality: None,
            final_compliance: None,
            image,
            stats: ReportStats::default(),
        };
        let background = job.options.background_color.unwrap_or(rules.background_rgb);

        for iteration in 1..=budget {
            if job.is_cancelled() {
                tracing::info!(job_id = %job.job_id, iteration, "Cancellation observed");
                outcome.termination = Termination::Cancelled;
                outcome.iterations.push(IterationResult {
                    iteration,
                    face_found: false,
                    quality_score: 0.0,
                    compliance_score: 0.0,
                    issues: vec![Issue::warning(
                        IssueCategory::Processing,
                        CODE_CANCELLED,
                        "Job cancelled before this iteration started",
                    )],
                    enhanced_image: None,
                    operations_applied: Vec::new(),
                    timings: StageTimings::default(),
                    elapsed_ms: 0.0,
                });
                break;
            }

            progress.enter(iteration);
            let current = outcome.image.clone();
            match self.iterate(job, iteration, iteration == budget, current, rules, background, &mut outcome) {
                Step::Next(image) => outcome.image = image,
                Step::Stop(termination) => {
                    outcome.termination = termination;
                    break;
                }
            }
        }

        outcome.stats.iterations_run = outcome
            .iterations
            .iter()
            .filter(|it| it.issues.iter().all(|i| i.code != CODE_CANCELLED))
            .count() as u32;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn iterate(
        &self,
        job: &Job,
        iteration: u32,
        last: bool,
        image: DynamicImage,
        rules: &FormatRules,
        background: [u8; 3],
        outcome: &mut LoopOutcome,
    ) -> Step {
        let started = Instant::now();
        let mut timings = StageTimings::default();
        let mut issues = Vec::new();
        // Final outcomes describe the last iteration only; a stage that fails
        // here must not leave an earlier iteration's outcome in place.
        outcome.final_quality = None;
        outcome.final_compliance = None;
        let mut record = IterationRecord {
            iteration,
            face_found: false,
            quality_score: 0.0,
            compliance_score: 0.0,
        };

        // 1. Detection
        let face = match timed(Stage::Detection, &mut timings.detection_ms, || {
            self.stages.detector.detect(&image)
        }) {
            Ok(face) => face,
            Err(e) => {
                let stop = stage_failure(job, &e, &mut issues);
                record.push(outcome, issues, timings, started);
                return stop.map_or(Step::Next(image), Step::Stop);
            }
        };
        record.face_found = face.found;
        if !face.found {
            issues.push(Issue::critical(
                IssueCategory::FaceDetection,
                CODE_NO_FACE_FOUND,
                format!("No face detected (confidence {:.2})", face.confidence),
            ));
            tracing::warn!(job_id = %job.job_id, iteration, "No face found");
            record.push(outcome, issues, timings, started);
            return Step::Stop(Termination::NoFace);
        }

        // 2. Segmentation
        let segmentation = match timed(Stage::Segmentation, &mut timings.segmentation_ms, || {
            self.stages.background.segment(&image)
        }) {
            Ok(seg) => Some(seg),
            Err(e) => {
                if let Some(stop) = stage_failure(job, &e, &mut issues) {
                    record.push(outcome, issues, timings, started);
                    return Step::Stop(stop);
                }
                None
            }
        };

        // 3. Quality
        match timed(Stage::Quality, &mut timings.quality_ms, || self.stages.quality.analyze(&image)) {
            Ok(quality) => {
                record.quality_score = quality.score;
                issues.extend(quality.issues.iter().cloned());
                outcome.final_quality = Some(quality);
            }
            Err(e) => {
                if let Some(stop) = stage_failure(job, &e, &mut issues) {
                    record.push(outcome, issues, timings, started);
                    return Step::Stop(stop);
                }
            }
        }

        // 4. Compliance
        match timed(Stage::Validation, &mut timings.validation_ms, || {
            self.stages
                .validator
                .validate(&image, &face, segmentation.as_ref(), rules)
        }) {
            Ok(compliance) => {
                record.compliance_score = compliance.score;
                issues.extend(compliance.issues.iter().cloned());
                outcome.final_compliance = Some(compliance);
            }
            Err(e) => {
                if let Some(stop) = stage_failure(job, &e, &mut issues) {
                    record.push(outcome, issues, timings, started);
                    return Step::Stop(stop);
                }
            }
        }

        tracing::info!(
            job_id = %job.job_id,
            iteration,
            quality = record.quality_score,
            compliance = record.compliance_score,
            issues = issues.len(),
            "Iteration scored"
        );

        // 5. Convergence
        if record.quality_score >= self.config.quality_threshold
            && record.compliance_score >= self.config.compliance_threshold
        {
            record.push(outcome, issues, timings, started);
            return Step::Stop(Termination::Converged);
        }
        if last {
            record.push(outcome, issues, timings, started);
            return Step::Stop(Termination::Exhausted);
        }

        // 6. Enhancement
        outcome.stats.enhancement_calls += 1;
        let mut enhancement_ms = 0.0;
        let enhanced = timed(Stage::Enhancement, &mut enhancement_ms, || {
            self.stages.enhancer.auto_fix(&image, &issues, background)
        });
        timings.enhancement_ms = Some(enhancement_ms);

        match enhanced {
            Ok(enhancement) => match enhancement.image {
                Some(next) => {
                    let revision = outcome.stats.enhancement_calls;
                    outcome
                        .stats
                        .operations_applied
                        .extend(enhancement.operations_applied.iter().cloned());
                    record.push_enhanced(outcome, issues, timings, started, revision, enhancement.operations_applied);
                    Step::Next(next)
                }
                None => {
                    tracing::info!(job_id = %job.job_id, iteration, "No applicable enhancement");
                    record.push(outcome, issues, timings, started);
                    Step::Stop(Termination::NoApplicableFix)
                }
            },
            Err(e) => {
                let stop = stage_failure(job, &e, &mut issues);
                record.push(outcome, issues, timings, started);
                stop.map_or(Step::Next(image), Step::Stop)
            }
        }
    }
}

/// Scores gathered so far for the iteration being built.
struct IterationRecord {
    iteration: u32,
    face_found: bool,
    quality_score: f64,
    compliance_score: f64,
}

impl IterationRecord {
    fn push(&self, outcome: &mut LoopOutcome, issues: Vec<Issue>, timings: StageTimings, started: Instant) {
        self.push_enhanced(outcome, issues, timings, started, 0, Vec::new());
    }

    fn push_enhanced(
        &self,
        outcome: &mut LoopOutcome,
        issues: Vec<Issue>,
        timings: StageTimings,
        started: Instant,
        revision: u32,
        operations_applied: Vec<String>,
    ) {
        outcome.iterations.push(IterationResult {
            iteration: self.iteration,
            face_found: self.face_found,
            quality_score: self.quality_score,
            compliance_score: self.compliance_score,
            issues,
            enhanced_image: (revision > 0).then_some(revision),
            operations_applied,
            timings,
            elapsed_ms: elapsed_ms(started),
        });
    }
}

/// Records the failure as an issue. Returns the termination for fatal failures,
/// `None` when the loop may carry on.
fn stage_failure(job: &Job, err: &StageError, issues: &mut Vec<Issue>) -> Option<Termination> {
    let category = match err.stage {
        Stage::Detection => IssueCategory::FaceDetection,
        Stage::Segmentation => IssueCategory::Background,
        Stage::Quality => IssueCategory::Quality,
        Stage::Validation => IssueCategory::Processing,
        Stage::Enhancement => IssueCategory::Enhancement,
    };
    if err.is_recoverable() {
        tracing::warn!(job_id = %job.job_id, stage = %err.stage, error = %err.message, "Recoverable stage failure");
        issues.push(Issue::new(Severity::Warning, category, err.code(), err.to_string()));
        None
    } else {
        tracing::error!(job_id = %job.job_id, stage = %err.stage, error = %err.message, "Stage failed");
        issues.push(Issue::new(Severity::Error, category, err.code(), err.to_string()));
        Some(Termination::StageFailure)
    }
}

fn timed<T>(stage: Stage, slot: &mut f64, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let result = f();
    let secs = started.elapsed().as_secs_f64();
    *slot = secs * 1000.0;
    metrics::histogram!("verify_stage_seconds", "stage" => stage.to_string()).record(secs);
    result
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{AuthContext, JobOptions};
    use crate::services::mock::{
        CountingEnhancer, EnhancerMode, FixedQualityAnalyzer, FixedValidator, MockFaceDetector, PixelScoredAnalyzer,
        StaticSegmenter,
    };
    use image::{Rgb, RgbImage};

    fn job() -> Job {
        Job::new("in.png", "out.png", "icao", AuthContext::default())
    }

    fn image_with_red(red: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(120, 120, Rgb([red, 100, 100])))
    }

    fn runner_with(enhancer: Arc<CountingEnhancer>, config: PipelineConfig) -> PipelineStageRunner {
        let mut stages = Collaborators::converging();
        stages.enhancer = enhancer;
        PipelineStageRunner::new(stages, config)
    }

    #[test]
    fn test_converged_image_needs_no_enhancement() {
        let enhancer = Arc::new(CountingEnhancer::new(EnhancerMode::Identity));
        let runner = runner_with(enhancer.clone(), PipelineConfig::default());
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());

        assert_eq!(outcome.termination, Termination::Converged);
        assert_eq!(outcome.iterations.len(), 1);
        assert_eq!(enhancer.calls(), 0);
        assert!(runner.is_success(&outcome));
    }

    #[test]
    fn test_unreachable_thresholds_stop_at_budget() {
        let enhancer = Arc::new(CountingEnhancer::new(EnhancerMode::Identity));
        let config = PipelineConfig {
            quality_threshold: 1.01,
            compliance_threshold: 1.01,
            ..PipelineConfig::default()
        };
        let runner = runner_with(enhancer.clone(), config);
        let progress = JobProgress::new();
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &progress);

        assert_eq!(outcome.termination, Termination::Exhausted);
        assert_eq!(outcome.iterations.len(), 3);
        assert_eq!(outcome.stats.iterations_run, 3);
        // No enhancement after the last iteration.
        assert_eq!(enhancer.calls(), 2);
        assert_eq!(progress.iteration(), 3);
        assert!(runner.is_success(&outcome), "no blocking issue remains");
    }

    #[test]
    fn test_exhaustion_fails_without_pass_policy() {
        let config = PipelineConfig {
            quality_threshold: 1.01,
            pass_on_exhaustion: false,
            ..PipelineConfig::default()
        };
        let runner = runner_with(Arc::new(CountingEnhancer::new(EnhancerMode::Identity)), config);
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());
        assert!(!runner.is_success(&outcome));
    }

    #[test]
    fn test_exhaustion_with_error_issue_fails() {
        let mut stages = Collaborators::converging();
        stages.validator = Arc::new(FixedValidator::new(0.5).with_issue(Issue::error(
            IssueCategory::Geometry,
            "FACE_HEIGHT_NON_COMPLIANT",
            "face too small",
        )));
        let runner = PipelineStageRunner::new(stages, PipelineConfig::default());
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());
        assert_eq!(outcome.termination, Termination::Exhausted);
        assert!(!runner.is_success(&outcome));
    }

    #[test]
    fn test_validation_failure_on_last_iteration_discards_earlier_outcome() {
        let mut stages = Collaborators::converging();
        stages.enhancer = Arc::new(CountingEnhancer::new(EnhancerMode::Identity));
        stages.validator = Arc::new(
            FixedValidator::new(0.5)
                .with_issue(Issue::error(IssueCategory::Geometry, "FACE_HEIGHT_NON_COMPLIANT", "face too small"))
                .failing_from(2, StageError::recoverable(Stage::Validation, "validator timed out")),
        );
        let config = PipelineConfig {
            max_iterations: 2,
            ..PipelineConfig::default()
        };
        let runner = PipelineStageRunner::new(stages, config);
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());

        assert_eq!(outcome.termination, Termination::Exhausted);
        assert_eq!(outcome.iterations.len(), 2);
        assert_eq!(outcome.iterations[1].issues[0].code, "VALIDATION_STAGE_FAILED");
        assert!(outcome.final_quality.is_some());
        assert!(outcome.final_compliance.is_none());
        assert!(!runner.is_success(&outcome));
    }

    #[test]
    fn test_detection_failure_on_last_iteration_fails_job() {
        let mut stages = Collaborators::converging();
        stages.detector = Arc::new(
            MockFaceDetector::found().failing_from(2, StageError::recoverable(Stage::Detection, "detector timed out")),
        );
        stages.enhancer = Arc::new(CountingEnhancer::new(EnhancerMode::Identity));
        stages.validator = Arc::new(FixedValidator::new(0.5));
        let config = PipelineConfig {
            max_iterations: 2,
            ..PipelineConfig::default()
        };
        let runner = PipelineStageRunner::new(stages, config);
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());

        assert_eq!(outcome.termination, Termination::Exhausted);
        assert_eq!(outcome.iterations.len(), 2);
        assert!(!outcome.iterations[1].face_found);
        assert!(outcome.final_quality.is_none());
        assert!(outcome.final_compliance.is_none());
        assert!(!runner.is_success(&outcome));
    }

    #[test]
    fn test_enhancement_converges_on_later_iteration() {
        let enhancer = Arc::new(CountingEnhancer::new(EnhancerMode::Brighten(30)));
        let mut stages = Collaborators::converging();
        stages.quality = Arc::new(PixelScoredAnalyzer);
        stages.enhancer = enhancer.clone();
        let runner = PipelineStageRunner::new(stages, PipelineConfig::default());

        // 200 -> 230 -> 255 (saturating): 255/255 >= 0.95 on iteration 3.
        let outcome = runner.run_iterations(&job(), image_with_red(200), &FormatRules::icao(), &JobProgress::new());
        assert_eq!(outcome.termination, Termination::Converged);
        assert_eq!(outcome.iterations.len(), 3);
        assert_eq!(enhancer.calls(), 2);
        assert_eq!(outcome.iterations[0].enhanced_image, Some(1));
        assert_eq!(outcome.stats.operations_applied, vec!["brighten_red", "brighten_red"]);
    }

    #[test]
    fn test_no_face_stops_immediately() {
        let mut stages = Collaborators::converging();
        stages.detector = Arc::new(MockFaceDetector::no_face());
        let runner = PipelineStageRunner::new(stages, PipelineConfig::default());
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());

        assert_eq!(outcome.termination, Termination::NoFace);
        assert_eq!(outcome.iterations.len(), 1);
        assert_eq!(outcome.iterations[0].issues[0].severity, Severity::Critical);
        assert!(!runner.is_success(&outcome));
    }

    #[test]
    fn test_nothing_applicable_stops_loop() {
        let mut stages = Collaborators::converging();
        stages.quality = Arc::new(FixedQualityAnalyzer::new(0.5));
        stages.enhancer = Arc::new(CountingEnhancer::new(EnhancerMode::Nothing));
        let runner = PipelineStageRunner::new(stages, PipelineConfig::default());
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());
        assert_eq!(outcome.termination, Termination::NoApplicableFix);
        assert_eq!(outcome.iterations.len(), 1);
    }

    #[test]
    fn test_recoverable_segmentation_failure_continues() {
        let mut stages = Collaborators::converging();
        stages.background = Arc::new(StaticSegmenter::failing(StageError::recoverable(
            Stage::Segmentation,
            "mask model timed out",
        )));
        let runner = PipelineStageRunner::new(stages, PipelineConfig::default());
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());
        assert_eq!(outcome.termination, Termination::Converged);
        let issue = &outcome.iterations[0].issues[0];
        assert_eq!(issue.code, "SEGMENTATION_STAGE_FAILED");
        assert_eq!(issue.severity, Severity::Warning);
    }

    #[test]
    fn test_fatal_detection_failure_fails_job() {
        let mut stages = Collaborators::converging();
        stages.detector = Arc::new(MockFaceDetector::failing(StageError::fatal(Stage::Detection, "model missing")));
        let runner = PipelineStageRunner::new(stages, PipelineConfig::default());
        let outcome = runner.run_iterations(&job(), image_with_red(255), &FormatRules::icao(), &JobProgress::new());
        assert_eq!(outcome.termination, Termination::StageFailure);
        assert!(!runner.is_success(&outcome));
    }

    #[test]
    fn test_cancelled_job_runs_no_iteration() {
        let job = job();
        job.cancel();
        let runner = PipelineStageRunner::new(Collaborators::converging(), PipelineConfig::default());
        let outcome = runner.run_iterations(&job, image_with_red(255), &FormatRules::icao(), &JobProgress::new());
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(outcome.stats.iterations_run, 0);
    }

    #[test]
    fn test_job_budget_is_capped() {
        let runner = PipelineStageRunner::new(Collaborators::converging(), PipelineConfig::default());
        let lowered = job().with_options(JobOptions {
            max_iterations: Some(1),
            ..JobOptions::default()
        });
        let raised = job().with_options(JobOptions {
            max_iterations: Some(9),
            ..JobOptions::default()
        });
        assert_eq!(runner.budget_for(&lowered), 1);
        assert_eq!(runner.budget_for(&raised), 3);
    }

    #[test]
    fn test_process_rejects_missing_input() {
        let runner = PipelineStageRunner::new(Collaborators::converging(), PipelineConfig::default());
        let report = runner.process(&job(), &FormatRules::icao(), &JobProgress::new());
        assert!(!report.success);
        assert_eq!(report.termination, Termination::InputRejected);
        assert_eq!(report.issues[0].code, CODE_IMAGE_LOAD_FAILED);
    }

    #[test]
    fn test_process_saves_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.png");
        let output = dir.path().join("out/result.png");
        image_with_red(255).save(&input).unwrap();

        let job = Job::new(&input, &output, "icao", AuthContext::default());
        let runner = PipelineStageRunner::new(Collaborators::converging(), PipelineConfig::default());
        let report = runner.process(&job, &FormatRules::icao(), &JobProgress::new());

        assert!(report.success);
        assert!(output.exists());
    }

    #[test]
    fn test_process_rejects_small_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tiny.png");
        DynamicImage::new_rgb8(40, 40).save(&input).unwrap();

        let job = Job::new(&input, dir.path().join("out.png"), "icao", AuthContext::default());
        let runner = PipelineStageRunner::new(Collaborators::converging(), PipelineConfig::default());
        let report = runner.process(&job, &FormatRules::icao(), &JobProgress::new());
        assert_eq!(report.issues[0].code, CODE_IMAGE_TOO_SMALL);
    }
}
