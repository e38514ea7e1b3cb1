//! Deterministic stand-ins for every collaborator, used by the tests and by
//! `batch --dry-run`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, GrayImage, Luma};

use crate::models::compliance::ComplianceOutcome;
use crate::models::format::FormatRules;
use crate::models::issue::{Issue, IssueCategory, Severity};
use crate::models::job::AuthContext;
use crate::models::status::SystemSnapshot;
use crate::services::pipeline::Collaborators;
use crate::services::resources::SystemSampler;
use crate::services::security::{AuditEvent, AuditSink, AuthorizationCheck};
use crate::services::stages::{
    BackgroundProcessor, BoundingBox, ComplianceValidator, Enhancement, EnhancementEngine, FaceDetection,
    FaceDetector, QualityAnalyzer, Segmentation, StageError,
};

/// Issue code raised by [`PixelScoredAnalyzer`] while the score is below 1.0.
pub const CODE_MOCK_DIM: &str = "MOCK_IMAGE_DIM";

/// Returns whatever snapshot was last set.
pub struct StaticSampler {
    snapshot: Mutex<SystemSnapshot>,
}

impl StaticSampler {
    pub fn new(snapshot: SystemSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// A lightly loaded machine.
    pub fn idle() -> Self {
        Self::new(SystemSnapshot {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
            available_memory_gb: 8.0,
        })
    }

    pub fn set(&self, snapshot: SystemSnapshot) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}

impl SystemSampler for StaticSampler {
    fn sample(&self) -> SystemSnapshot {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
enum DetectorScript {
    Found,
    NoFace,
    Fail(StageError),
}

/// Face detector that sleeps for `delay` and then answers from its script.
pub struct MockFaceDetector {
    script: DetectorScript,
    delay: Duration,
    fail_from: Option<(u32, StageError)>,
    calls: AtomicU32,
}

impl MockFaceDetector {
    fn scripted(script: DetectorScript) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            fail_from: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn found() -> Self {
        Self::scripted(DetectorScript::Found)
    }

    pub fn no_face() -> Self {
        Self::scripted(DetectorScript::NoFace)
    }

    pub fn failing(error: StageError) -> Self {
        Self::scripted(DetectorScript::Fail(error))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer from the script until call number `call` (1-based), then fail with `error`.
    pub fn failing_from(mut self, call: u32, error: StageError) -> Self {
        self.fail_from = Some((call, error));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceDetector for MockFaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<FaceDetection, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some((from, err)) = &self.fail_from {
            if call >= *from {
                return Err(err.clone());
            }
        }
        match &self.script {
            DetectorScript::Found => {
                let (w, h) = (image.width() as f64, image.height() as f64);
                let mut face = FaceDetection::not_found(0.99);
                face.found = true;
                face.bbox = Some(BoundingBox {
                    x: w * 0.3,
                    y: h * 0.15,
                    width: w * 0.4,
                    height: h * 0.65,
                });
                Ok(face)
            }
            DetectorScript::NoFace => Ok(FaceDetection::not_found(0.05)),
            DetectorScript::Fail(err) => Err(err.clone()),
        }
    }
}

/// Reports a perfectly uniform background covering the whole image.
#[derive(Default)]
pub struct StaticSegmenter {
    fail: Option<StageError>,
}

impl StaticSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: StageError) -> Self {
        Self { fail: Some(error) }
    }
}

impl BackgroundProcessor for StaticSegmenter {
    fn segment(&self, image: &DynamicImage) -> Result<Segmentation, StageError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let (w, h) = (image.width(), image.height());
        Ok(Segmentation {
            mask: GrayImage::from_pixel(w, h, Luma([255])),
            confidence_map: GrayImage::from_pixel(w, h, Luma([255])),
            subject_area: 0.0,
            uniformity: 1.0,
            background_rgb: [240.0, 240.0, 240.0],
        })
    }

    fn replace(&self, image: &DynamicImage, _mask: &GrayImage, _color: [u8; 3]) -> Result<DynamicImage, StageError> {
        Ok(image.clone())
    }
}

fn scored_outcome(name: &str, score: f64, issues: Vec<Issue>) -> ComplianceOutcome {
    let mut met = BTreeMap::new();
    met.insert(name.to_string(), issues.is_empty());
    let mut measurements = BTreeMap::new();
    measurements.insert(name.to_string(), score);
    ComplianceOutcome::from_parts(score, met, measurements, issues)
}

/// Always reports the same quality score.
pub struct FixedQualityAnalyzer {
    score: f64,
    issues: Vec<Issue>,
}

impl FixedQualityAnalyzer {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }
}

impl QualityAnalyzer for FixedQualityAnalyzer {
    fn analyze(&self, _image: &DynamicImage) -> Result<ComplianceOutcome, StageError> {
        Ok(scored_outcome("mock_quality", self.score, self.issues.clone()))
    }
}

/// Quality score equal to the red channel of pixel (0, 0) divided by 255, so
/// the score is a pure function of the image.
#[derive(Default)]
pub struct PixelScoredAnalyzer;

impl QualityAnalyzer for PixelScoredAnalyzer {
    fn analyze(&self, image: &DynamicImage) -> Result<ComplianceOutcome, StageError> {
        let red = image.to_rgb8().get_pixel(0, 0).0[0];
        let score = red as f64 / 255.0;
        let issues = if red < 255 {
            vec![Issue::new(Severity::Warning, IssueCategory::Quality, CODE_MOCK_DIM, "image too dim").fixable(true)]
        } else {
            Vec::new()
        };
        Ok(scored_outcome("pixel_brightness", score, issues))
    }
}

/// Always reports the same compliance score.
pub struct FixedValidator {
    score: f64,
    issues: Vec<Issue>,
    fail_from: Option<(u32, StageError)>,
    calls: AtomicU32,
}

impl FixedValidator {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            issues: Vec::new(),
            fail_from: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }

    /// Score normally until call number `call` (1-based), then fail with `error`.
    pub fn failing_from(mut self, call: u32, error: StageError) -> Self {
        self.fail_from = Some((call, error));
        self
    }
}

impl ComplianceValidator for FixedValidator {
    fn validate(
        &self,
        _image: &DynamicImage,
        face: &FaceDetection,
        _segmentation: Option<&Segmentation>,
        _rules: &FormatRules,
    ) -> Result<ComplianceOutcome, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((from, err)) = &self.fail_from {
            if call >= *from {
                return Err(err.clone());
            }
        }
        if !face.found {
            return Ok(ComplianceOutcome::failed_with(Issue::critical(
                IssueCategory::FaceDetection,
                "NO_FACE_DETECTED",
                "no face",
            )));
        }
        Ok(scored_outcome("mock_compliance", self.score, self.issues.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancerMode {
    /// Return the image unchanged as a new revision.
    Identity,
    /// Add this much to the red channel of every pixel.
    Brighten(u8),
    /// Report that no fix applies.
    Nothing,
    /// Panic inside the worker.
    Panic,
}

/// Enhancement engine that counts its calls.
pub struct CountingEnhancer {
    mode: EnhancerMode,
    calls: AtomicU32,
}

impl CountingEnhancer {
    pub fn new(mode: EnhancerMode) -> Self {
        Self {
            mode,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EnhancementEngine for CountingEnhancer {
    fn auto_fix(&self, image: &DynamicImage, _issues: &[Issue], _background: [u8; 3]) -> Result<Enhancement, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (image, op) = match self.mode {
            EnhancerMode::Identity => (image.clone(), "identity"),
            EnhancerMode::Brighten(step) => {
                let mut rgb = image.to_rgb8();
                for p in rgb.pixels_mut() {
                    p.0[0] = p.0[0].saturating_add(step);
                }
                (DynamicImage::ImageRgb8(rgb), "brighten_red")
            }
            EnhancerMode::Nothing => return Ok(Enhancement::nothing_applicable()),
            EnhancerMode::Panic => panic!("enhancer exploded"),
        };
        Ok(Enhancement {
            image: Some(image),
            operations_applied: vec![op.to_string()],
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DenyAll;

impl AuthorizationCheck for DenyAll {
    fn authorize(&self, _context: &AuthContext, _resource: &str, _action: &str) -> bool {
        false
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl Collaborators {
    /// Every stage passes on the first iteration.
    pub fn converging() -> Self {
        Self {
            detector: Arc::new(MockFaceDetector::found()),
            background: Arc::new(StaticSegmenter::new()),
            quality: Arc::new(FixedQualityAnalyzer::new(1.0)),
            enhancer: Arc::new(CountingEnhancer::new(EnhancerMode::Identity)),
            validator: Arc::new(FixedValidator::new(1.0)),
        }
    }
}
