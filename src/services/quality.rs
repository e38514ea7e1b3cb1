//! Image quality analysis: brightness, contrast, sharpness, noise and compression.

use image::{DynamicImage, GrayImage};

use crate::models::compliance::ComplianceOutcome;
use crate::models::format::Band;
use crate::models::issue::IssueCategory;
use crate::services::scoring::{ComplianceScorer, RequirementCheck};
use crate::services::stages::{QualityAnalyzer, Stage, StageError};

/// Laplacian variance treated as "fully sharp".
const SHARPNESS_REFERENCE: f64 = 100.0;

/// JPEG block size used by the blockiness estimate.
const BLOCK: u32 = 8;

pub const CODE_BRIGHTNESS: &str = "BRIGHTNESS_OUT_OF_RANGE";
pub const CODE_CONTRAST: &str = "CONTRAST_OUT_OF_RANGE";
pub const CODE_SHARPNESS: &str = "IMAGE_NOT_SHARP";
pub const CODE_NOISE: &str = "NOISE_TOO_HIGH";
pub const CODE_COMPRESSION: &str = "COMPRESSION_ARTIFACTS_HIGH";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityRules {
    /// Mean luma in `0..=1`.
    pub brightness: Band,
    /// Luma standard deviation in `0..=1`.
    pub contrast: Band,
    /// Normalised Laplacian variance, expected near 1.0.
    pub sharpness: Band,
    /// Estimated noise sigma in `0..=1`.
    pub noise: Band,
    pub compression: Band,
}

impl Default for QualityRules {
    fn default() -> Self {
        Self {
            brightness: Band::new(0.55, 0.2),
            contrast: Band::new(0.25, 0.12),
            sharpness: Band::new(1.0, 0.5),
            noise: Band::at_most(0.04),
            compression: Band::at_most(0.1),
        }
    }
}

/// Raw measurements before scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    pub brightness: f64,
    pub contrast: f64,
    pub sharpness: f64,
    pub noise: f64,
    pub compression: f64,
}

impl QualityMetrics {
    pub fn measure(gray: &GrayImage) -> Self {
        let (brightness, contrast) = mean_and_stddev(gray);
        Self {
            brightness,
            contrast,
            sharpness: (laplacian_variance(gray) / SHARPNESS_REFERENCE).min(1.0),
            noise: noise_sigma(gray),
            compression: blockiness(gray),
        }
    }
}

/// Production [`QualityAnalyzer`] working on the luma channel.
#[derive(Debug, Clone, Default)]
pub struct ImageQualityAnalyzer {
    rules: QualityRules,
}

impl ImageQualityAnalyzer {
    pub fn new(rules: QualityRules) -> Self {
        Self { rules }
    }

    pub fn score(&self, metrics: &QualityMetrics) -> ComplianceOutcome {
        let r = &self.rules;
        let mut scorer = ComplianceScorer::new();
        scorer
            .check(
                RequirementCheck::primary("brightness", IssueCategory::Quality, r.brightness, metrics.brightness)
                    .code(CODE_BRIGHTNESS)
                    .fixable(),
            )
            .check(
                RequirementCheck::primary("contrast", IssueCategory::Quality, r.contrast, metrics.contrast)
                    .code(CODE_CONTRAST)
                    .fixable(),
            )
            .check(
                RequirementCheck::primary("sharpness", IssueCategory::Quality, r.sharpness, metrics.sharpness)
                    .code(CODE_SHARPNESS)
                    .fixable(),
            )
            .check(
                RequirementCheck::primary("noise", IssueCategory::Quality, r.noise, metrics.noise)
                    .code(CODE_NOISE)
                    .fixable(),
            )
            .check(
                RequirementCheck::informational(
                    "compression_artifacts",
                    IssueCategory::Quality,
                    r.compression,
                    metrics.compression,
                )
                .code(CODE_COMPRESSION),
            );
        scorer.finish()
    }
}

impl QualityAnalyzer for ImageQualityAnalyzer {
    fn analyze(&self, image: &DynamicImage) -> Result<ComplianceOutcome, StageError> {
        let gray = image.to_luma8();
        if gray.width() < 3 || gray.height() < 3 {
            return Err(StageError::fatal(Stage::Quality, "image too small to analyse"));
        }
        Ok(self.score(&QualityMetrics::measure(&gray)))
    }
}

fn luma(gray: &GrayImage, x: u32, y: u32) -> f64 {
    gray.get_pixel(x, y).0[0] as f64
}

/// Mean and standard deviation of luma, both normalised to `0..=1`.
fn mean_and_stddev(gray: &GrayImage) -> (f64, f64) {
    let n = (gray.width() * gray.height()) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = gray.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
    let variance = gray.pixels().map(|p| (p.0[0] as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean / 255.0, variance.sqrt() / 255.0)
}

/// Variance of the 4-neighbour Laplacian.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = luma(gray, x - 1, y) + luma(gray, x + 1, y) + luma(gray, x, y - 1) + luma(gray, x, y + 1)
                - 4.0 * luma(gray, x, y);
            values.push(lap);
        }
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Immerkaer's fast noise variance estimate, normalised to `0..=1`.
fn noise_sigma(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    let mut sum = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let v = luma(gray, x - 1, y - 1) - 2.0 * luma(gray, x, y - 1) + luma(gray, x + 1, y - 1)
                - 2.0 * luma(gray, x - 1, y)
                + 4.0 * luma(gray, x, y)
                - 2.0 * luma(gray, x + 1, y)
                + luma(gray, x - 1, y + 1)
                - 2.0 * luma(gray, x, y + 1)
                + luma(gray, x + 1, y + 1);
            sum += v.abs();
        }
    }
    let sigma = sum * (std::f64::consts::PI / 2.0).sqrt() / (6.0 * (w - 2) as f64 * (h - 2) as f64);
    sigma / 255.0
}

/// How much stronger horizontal gradients are across 8px block edges than inside blocks.
pub fn blockiness(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w <= BLOCK {
        return 0.0;
    }
    let (mut edge_sum, mut edge_n, mut inner_sum, mut inner_n) = (0.0, 0u64, 0.0, 0u64);
    for y in 0..h {
        for x in 1..w {
            let diff = (luma(gray, x, y) - luma(gray, x - 1, y)).abs();
            if x % BLOCK == 0 {
                edge_sum += diff;
                edge_n += 1;
            } else {
                inner_sum += diff;
                inner_n += 1;
            }
        }
    }
    if edge_n == 0 || inner_n == 0 {
        return 0.0;
    }
    let edge = edge_sum / edge_n as f64;
    let inner = inner_sum / inner_n as f64;
    if edge <= inner {
        0.0
    } else {
        ((edge - inner) / (edge + inner)).min(1.0)
    }
}
