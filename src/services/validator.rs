//! Format-rule compliance validation.

use image::DynamicImage;

use crate::models::compliance::ComplianceOutcome;
use crate::models::format::{Band, FormatRules};
use crate::models::issue::{Issue, IssueCategory};
use crate::services::quality::{blockiness, CODE_COMPRESSION};
use crate::services::scoring::{ComplianceScorer, RequirementCheck};
use crate::services::stages::{ComplianceValidator, FaceDetection, Segmentation, StageError};

pub const CODE_NO_FACE: &str = "NO_FACE_DETECTED";
pub const CODE_FACE_BOUNDS: &str = "FACE_BOUNDS_MISSING";
pub const CODE_FACE_HEIGHT: &str = "FACE_HEIGHT_NON_COMPLIANT";
pub const CODE_EYE_LINE: &str = "EYE_LINE_NON_COMPLIANT";
pub const CODE_CENTER_OFFSET: &str = "FACE_OFF_CENTER";
pub const CODE_HEAD_ROTATION: &str = "HEAD_ROTATION_NON_COMPLIANT";
pub const CODE_BACKGROUND_COLOR: &str = "BACKGROUND_COLOR_NON_COMPLIANT";
pub const CODE_BACKGROUND_UNIFORMITY: &str = "BACKGROUND_NOT_UNIFORM";
pub const CODE_BACKGROUND_UNASSESSED: &str = "BACKGROUND_NOT_ASSESSED";
pub const CODE_FACE_QUALITY: &str = "FACE_QUALITY_LOW";
pub const CODE_DIMENSIONS: &str = "INVALID_DIMENSIONS";

/// Key in [`FaceDetection::metrics`] carrying the detector's face quality estimate.
pub const METRIC_FACE_QUALITY: &str = "overall_quality";

/// Production [`ComplianceValidator`] scoring geometry, background and format facts.
#[derive(Debug, Clone, Default)]
pub struct RuleValidator;

impl RuleValidator {
    pub fn new() -> Self {
        Self
    }

    fn face_geometry(scorer: &mut ComplianceScorer, face: &FaceDetection, rules: &FormatRules, w: f64, h: f64) {
        match face.bbox {
            Some(bbox) => {
                scorer
                    .check(
                        RequirementCheck::primary(
                            "face_height_ratio",
                            IssueCategory::Geometry,
                            rules.face_height_ratio,
                            bbox.height / h,
                        )
                        .code(CODE_FACE_HEIGHT),
                    )
                    .check(
                        RequirementCheck::primary(
                            "face_center_offset",
                            IssueCategory::Geometry,
                            rules.center_offset,
                            (bbox.center_x() - w / 2.0).abs() / w,
                        )
                        .code(CODE_CENTER_OFFSET),
                    );
            }
            None => {
                scorer.flag(
                    "face_bounds",
                    false,
                    Issue::error(IssueCategory::Geometry, CODE_FACE_BOUNDS, "Detector returned no face bounds"),
                );
            }
        }

        if let Some(eye_y) = face.eye_line_y() {
            scorer.check(
                RequirementCheck::primary("eye_line_ratio", IssueCategory::Geometry, rules.eye_line_ratio, eye_y / h)
                    .code(CODE_EYE_LINE),
            );
        }

        scorer.check(
            RequirementCheck::primary(
                "head_rotation",
                IssueCategory::Geometry,
                rules.head_rotation_deg,
                face.angle.max_abs(),
            )
            .code(CODE_HEAD_ROTATION)
            .label("head rotation (deg)"),
        );

        if let Some(quality) = face.metrics.get(METRIC_FACE_QUALITY) {
            scorer.check(
                RequirementCheck::primary("face_quality", IssueCategory::Quality, rules.face_quality, *quality)
                    .code(CODE_FACE_QUALITY),
            );
        }
    }

    fn background(scorer: &mut ComplianceScorer, segmentation: Option<&Segmentation>, rules: &FormatRules) {
        let Some(seg) = segmentation else {
            scorer.issue(Issue::warning(
                IssueCategory::Background,
                CODE_BACKGROUND_UNASSESSED,
                "Background could not be segmented",
            ));
            return;
        };

        let target = rules.background_rgb.map(f64::from);
        let distance = seg
            .background_rgb
            .iter()
            .zip(target.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();

        scorer
            .check(
                RequirementCheck::primary(
                    "background_color",
                    IssueCategory::Background,
                    rules.background_distance,
                    distance,
                )
                .code(CODE_BACKGROUND_COLOR)
                .label("background colour distance")
                .fixable(),
            )
            .check(
                RequirementCheck::secondary(
                    "background_uniformity",
                    IssueCategory::Background,
                    Band::at_least(rules.min_background_uniformity),
                    seg.uniformity,
                )
                .code(CODE_BACKGROUND_UNIFORMITY)
                .fixable(),
            )
            .measure("subject_area", seg.subject_area);
    }

    fn format(scorer: &mut ComplianceScorer, image: &DynamicImage, rules: &FormatRules) {
        let (w, h) = (image.width(), image.height());
        scorer.measure("image_width", w as f64).measure("image_height", h as f64);

        if let Some((rw, rh)) = rules.dimensions {
            scorer.flag(
                "image_dimensions",
                (w, h) == (rw, rh),
                Issue::error(
                    IssueCategory::Format,
                    CODE_DIMENSIONS,
                    format!("Image dimensions {w}x{h} do not match required {rw}x{rh}"),
                ),
            );
        }

        scorer.check(
            RequirementCheck::informational(
                "compression_artifacts",
                IssueCategory::Format,
                Band::at_most(rules.max_compression_artifacts),
                blockiness(&image.to_luma8()),
            )
            .code(CODE_COMPRESSION),
        );
    }
}

impl ComplianceValidator for RuleValidator {
    fn validate(
        &self,
        image: &DynamicImage,
        face: &FaceDetection,
        segmentation: Option<&Segmentation>,
        rules: &FormatRules,
    ) -> Result<ComplianceOutcome, StageError> {
        if !face.found {
            return Ok(ComplianceOutcome::failed_with(Issue::critical(
                IssueCategory::FaceDetection,
                CODE_NO_FACE,
                "No face detected - compliance cannot be assessed",
            )));
        }

        let (w, h) = (image.width() as f64, image.height() as f64);
        let mut scorer = ComplianceScorer::new();
        Self::face_geometry(&mut scorer, face, rules, w, h);
        Self::background(&mut scorer, segmentation, rules);
        Self::format(&mut scorer, image, rules);
        Ok(scorer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::issue::Severity;
    use crate::services::background::BorderSegmenter;
    use crate::services::stages::{BackgroundProcessor, BoundingBox, HeadPose, Point};
    use image::{Rgb, RgbImage};

    fn compliant_face(w: f64, h: f64) -> FaceDetection {
        let mut face = FaceDetection::not_found(0.99);
        face.found = true;
        face.bbox = Some(BoundingBox {
            x: w * 0.3,
            y: h * 0.15,
            width: w * 0.4,
            height: h * 0.655,
        });
        face.landmarks.insert("left_eye".into(), Point { x: w * 0.4, y: h * 0.345 });
        face.landmarks.insert("right_eye".into(), Point { x: w * 0.6, y: h * 0.345 });
        face.angle = HeadPose {
            yaw: 0.5,
            pitch: -0.5,
            roll: 0.0,
        };
        face.metrics.insert(METRIC_FACE_QUALITY.into(), 0.97);
        face
    }

    fn portrait(background: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(100, 100, |x, y| {
            if (30..70).contains(&x) && (20..85).contains(&y) {
                Rgb([90, 60, 50])
            } else {
                Rgb(background)
            }
        }))
    }

    #[test]
    fn test_compliant_portrait_scores_fully() {
        let rules = FormatRules::icao();
        let image = portrait([240, 240, 240]);
        let seg = BorderSegmenter::new().segment(&image).unwrap();
        let outcome = RuleValidator::new()
            .validate(&image, &compliant_face(100.0, 100.0), Some(&seg), &rules)
            .unwrap();
        assert!(outcome.passed, "issues: {:?}", outcome.issues);
        assert_eq!(outcome.score, 1.0);
    }

    #[test]
    fn test_wrong_background_is_fixable_error() {
        let rules = FormatRules::icao();
        let image = portrait([200, 220, 240]);
        let seg = BorderSegmenter::new().segment(&image).unwrap();
        let outcome = RuleValidator::new()
            .validate(&image, &compliant_face(100.0, 100.0), Some(&seg), &rules)
            .unwrap();
        let issue = outcome.issues.iter().find(|i| i.code == CODE_BACKGROUND_COLOR).unwrap();
        assert!(issue.auto_fixable);
        assert!(!outcome.passed);
    }

    #[test]
    fn test_no_face_is_critical() {
        let outcome = RuleValidator::new()
            .validate(
                &portrait([240, 240, 240]),
                &FaceDetection::not_found(0.1),
                None,
                &FormatRules::icao(),
            )
            .unwrap();
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.issues[0].code, CODE_NO_FACE);
    }

    #[test]
    fn test_missing_segmentation_is_advisory() {
        let outcome = RuleValidator::new()
            .validate(
                &portrait([240, 240, 240]),
                &compliant_face(100.0, 100.0),
                None,
                &FormatRules::icao(),
            )
            .unwrap();
        assert!(outcome.passed);
        assert!(outcome.issues.iter().any(|i| i.code == CODE_BACKGROUND_UNASSESSED));
    }

    #[test]
    fn test_block_artifacts_are_informational() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(96, 96, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }));
        let outcome = RuleValidator::new()
            .validate(&image, &compliant_face(96.0, 96.0), None, &FormatRules::icao())
            .unwrap();
        let issue = outcome.issues.iter().find(|i| i.code == CODE_COMPRESSION).unwrap();
        assert_eq!(issue.severity, Severity::Info);
        assert_eq!(outcome.requirements_met.get("compression_artifacts"), Some(&false));
    }

    #[test]
    fn test_dimension_mismatch_blocks() {
        let image = portrait([255, 255, 255]);
        let seg = BorderSegmenter::new().segment(&image).unwrap();
        let outcome = RuleValidator::new()
            .validate(&image, &compliant_face(100.0, 100.0), Some(&seg), &FormatRules::us_passport())
            .unwrap();
        assert!(outcome.issues.iter().any(|i| i.code == CODE_DIMENSIONS));
        assert!(!outcome.passed);
    }
}
