//! Issue-driven image corrections.

use std::sync::Arc;

use image::DynamicImage;

use crate::models::issue::Issue;
use crate::services::quality::{CODE_BRIGHTNESS, CODE_CONTRAST, CODE_NOISE, CODE_SHARPNESS};
use crate::services::stages::{BackgroundProcessor, Enhancement, EnhancementEngine, StageError};
use crate::services::validator::{CODE_BACKGROUND_COLOR, CODE_BACKGROUND_UNIFORMITY};

/// Mean luma the brightness correction aims for.
const TARGET_LUMA: f64 = 140.0;

/// Contrast step in percent per correction.
const CONTRAST_STEP: f32 = 20.0;

const TARGET_CONTRAST: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Brightness,
    Contrast,
    Sharpen,
    Denoise,
    ReplaceBackground,
}

impl Operation {
    fn for_code(code: &str) -> Option<Self> {
        match code {
            CODE_BRIGHTNESS => Some(Self::Brightness),
            CODE_CONTRAST => Some(Self::Contrast),
            CODE_SHARPNESS => Some(Self::Sharpen),
            CODE_NOISE => Some(Self::Denoise),
            CODE_BACKGROUND_COLOR | CODE_BACKGROUND_UNIFORMITY => Some(Self::ReplaceBackground),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Brightness => "brightness_correction",
            Self::Contrast => "contrast_correction",
            Self::Sharpen => "unsharp_mask",
            Self::Denoise => "denoise",
            Self::ReplaceBackground => "background_replacement",
        }
    }
}

/// Production [`EnhancementEngine`] built on `image::imageops`.
pub struct ImageEnhancer {
    background: Arc<dyn BackgroundProcessor>,
}

impl ImageEnhancer {
    pub fn new(background: Arc<dyn BackgroundProcessor>) -> Self {
        Self { background }
    }

    fn apply(&self, image: DynamicImage, op: Operation, background: [u8; 3]) -> Result<DynamicImage, StageError> {
        Ok(match op {
            Operation::Brightness => {
                let (mean, _) = luma_stats(&image);
                image.brighten((TARGET_LUMA - mean).round() as i32)
            }
            Operation::Contrast => {
                let (_, stddev) = luma_stats(&image);
                let step = if stddev / 255.0 < TARGET_CONTRAST {
                    CONTRAST_STEP
                } else {
                    -CONTRAST_STEP
                };
                image.adjust_contrast(step)
            }
            Operation::Sharpen => image.unsharpen(1.5, 2),
            Operation::Denoise => image.blur(0.8),
            Operation::ReplaceBackground => {
                let segmentation = self.background.segment(&image)?;
                self.background.replace(&image, &segmentation.mask, background)?
            }
        })
    }
}

impl EnhancementEngine for ImageEnhancer {
    fn auto_fix(&self, image: &DynamicImage, issues: &[Issue], background: [u8; 3]) -> Result<Enhancement, StageError> {
        let mut operations: Vec<Operation> = Vec::new();
        for issue in issues.iter().filter(|i| i.auto_fixable) {
            if let Some(op) = Operation::for_code(&issue.code) {
                if !operations.contains(&op) {
                    operations.push(op);
                }
            }
        }
        if operations.is_empty() {
            return Ok(Enhancement::nothing_applicable());
        }

        // Background first so tone corrections see the final background.
        operations.sort_by_key(|op| *op != Operation::ReplaceBackground);

        let mut current = image.clone();
        let mut applied = Vec::with_capacity(operations.len());
        for op in operations {
            current = self.apply(current, op, background)?;
            applied.push(op.name().to_string());
        }
        tracing::debug!(operations = ?applied, "Enhancement applied");

        Ok(Enhancement {
            image: Some(current),
            operations_applied: applied,
        })
    }
}

fn luma_stats(image: &DynamicImage) -> (f64, f64) {
    let gray = image.to_luma8();
    let n = (gray.width() as f64 * gray.height() as f64).max(1.0);
    let mean = gray.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
    let var = gray.pixels().map(|p| (p.0[0] as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::issue::IssueCategory;
    use crate::services::background::BorderSegmenter;
    use image::{Rgb, RgbImage};

    fn enhancer() -> ImageEnhancer {
        ImageEnhancer::new(Arc::new(BorderSegmenter::new()))
    }

    fn fixable(code: &str) -> Issue {
        Issue::error(IssueCategory::Quality, code, "needs fixing").fixable(true)
    }

    #[test]
    fn test_nothing_applicable() {
        let image = DynamicImage::new_rgb8(16, 16);
        let unfixable = Issue::error(IssueCategory::Geometry, "HEAD_ROTATION_NON_COMPLIANT", "tilted");
        let result = enhancer().auto_fix(&image, &[unfixable], [240, 240, 240]).unwrap();
        assert!(result.image.is_none());
        assert!(result.operations_applied.is_empty());
    }

    #[test]
    fn test_brightness_moves_towards_target() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([20, 20, 20])));
        let result = enhancer()
            .auto_fix(&image, &[fixable(CODE_BRIGHTNESS), fixable(CODE_BRIGHTNESS)], [240, 240, 240])
            .unwrap();
        assert_eq!(result.operations_applied, vec!["brightness_correction"]);
        let (mean, _) = luma_stats(&result.image.unwrap());
        assert!(mean > 100.0);
    }

    #[test]
    fn test_background_runs_first() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([200, 180, 180])));
        let result = enhancer()
            .auto_fix(&image, &[fixable(CODE_SHARPNESS), fixable(CODE_BACKGROUND_COLOR)], [240, 240, 240])
            .unwrap();
        assert_eq!(result.operations_applied, vec!["background_replacement", "unsharp_mask"]);
    }
}
