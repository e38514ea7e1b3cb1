//! Interfaces of the pipeline stage collaborators and the data they exchange.
//!
//! Every collaborator is synchronous from the caller's point of view; the
//! controller runs the pipeline on a blocking worker thread.

use std::collections::BTreeMap;

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::compliance::ComplianceOutcome;
use crate::models::format::FormatRules;
use crate::models::issue::Issue;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center_x(&self) -> f64 {
        self.x + self.width / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Head pose in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl HeadPose {
    pub fn max_abs(&self) -> f64 {
        self.yaw.abs().max(self.pitch.abs()).max(self.roll.abs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub found: bool,
    pub confidence: f64,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub landmarks: BTreeMap<String, Point>,
    #[serde(default)]
    pub angle: HeadPose,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl FaceDetection {
    pub fn not_found(confidence: f64) -> Self {
        Self {
            found: false,
            confidence,
            bbox: None,
            landmarks: BTreeMap::new(),
            angle: HeadPose::default(),
            metrics: BTreeMap::new(),
        }
    }

    /// Vertical position of the eyes, averaged over the eye landmarks present.
    pub fn eye_line_y(&self) -> Option<f64> {
        let eyes: Vec<f64> = ["left_eye", "right_eye"]
            .iter()
            .filter_map(|name| self.landmarks.get(*name))
            .map(|p| p.y)
            .collect();
        if eyes.is_empty() {
            None
        } else {
            Some(eyes.iter().sum::<f64>() / eyes.len() as f64)
        }
    }
}

/// Background segmentation. Mask pixels at 255 are background.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub mask: GrayImage,
    pub confidence_map: GrayImage,
    /// Fraction of the image covered by the subject.
    pub subject_area: f64,
    /// 1.0 for a perfectly flat background.
    pub uniformity: f64,
    pub background_rgb: [f64; 3],
}

#[derive(Debug, Clone, Default)]
pub struct Enhancement {
    /// `None` when no operation was applicable.
    pub image: Option<DynamicImage>,
    pub operations_applied: Vec<String>,
}

impl Enhancement {
    pub fn nothing_applicable() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Detection,
    Segmentation,
    Quality,
    Validation,
    Enhancement,
}

/// Failure reported by a stage collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{stage} stage failed: {message}")]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
    /// Recoverable failures are logged and the loop continues with the unmodified image.
    pub recoverable: bool,
}

impl StageError {
    pub fn recoverable(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn code(&self) -> String {
        format!("{}_STAGE_FAILED", self.stage.to_string().to_uppercase())
    }
}

pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<FaceDetection, StageError>;
}

pub trait BackgroundProcessor: Send + Sync {
    fn segment(&self, image: &DynamicImage) -> Result<Segmentation, StageError>;

    fn replace(&self, image: &DynamicImage, mask: &GrayImage, color: [u8; 3]) -> Result<DynamicImage, StageError>;
}

pub trait QualityAnalyzer: Send + Sync {
    fn analyze(&self, image: &DynamicImage) -> Result<ComplianceOutcome, StageError>;
}

pub trait EnhancementEngine: Send + Sync {
    /// Apply fixes for the given issues. `background` is the colour to use if the
    /// background has to be replaced.
    fn auto_fix(&self, image: &DynamicImage, issues: &[Issue], background: [u8; 3]) -> Result<Enhancement, StageError>;
}

pub trait ComplianceValidator: Send + Sync {
    /// Validate face, background and image facts against the format rules.
    /// `segmentation` is `None` when the segmentation stage failed recoverably.
    fn validate(
        &self,
        image: &DynamicImage,
        face: &FaceDetection,
        segmentation: Option<&Segmentation>,
        rules: &FormatRules,
    ) -> Result<ComplianceOutcome, StageError>;
}
