//! Border-sampling background segmentation.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};

use crate::services::stages::{BackgroundProcessor, Segmentation, Stage, StageError};

/// Channel standard deviation at which uniformity reaches zero.
const UNIFORMITY_SCALE: f64 = 64.0;

/// Minimum colour distance still counted as background.
const MIN_MATCH_DISTANCE: f64 = 24.0;

/// Estimates the background from the image border and masks pixels close to it.
#[derive(Debug, Clone, Default)]
pub struct BorderSegmenter;

impl BorderSegmenter {
    pub fn new() -> Self {
        Self
    }

    fn border_width(width: u32, height: u32) -> u32 {
        (width.min(height) / 10).clamp(1, 50)
    }

    fn border_pixels(rgb: &RgbImage) -> Vec<[f64; 3]> {
        let (w, h) = rgb.dimensions();
        let b = Self::border_width(w, h);
        rgb.enumerate_pixels()
            .filter(|(x, y, _)| *x < b || *y < b || *x >= w - b || *y >= h - b)
            .map(|(_, _, p)| [p.0[0] as f64, p.0[1] as f64, p.0[2] as f64])
            .collect()
    }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

impl BackgroundProcessor for BorderSegmenter {
    fn segment(&self, image: &DynamicImage) -> Result<Segmentation, StageError> {
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        if w < 3 || h < 3 {
            return Err(StageError::recoverable(Stage::Segmentation, "image too small to segment"));
        }

        let border = Self::border_pixels(&rgb);
        let n = border.len() as f64;
        let mut mean = [0.0; 3];
        for p in &border {
            for c in 0..3 {
                mean[c] += p[c];
            }
        }
        for channel in &mut mean {
            *channel /= n;
        }
        let mut spread = 0.0;
        for c in 0..3 {
            let var = border.iter().map(|p| (p[c] - mean[c]).powi(2)).sum::<f64>() / n;
            spread += var.sqrt() / 3.0;
        }
        let uniformity = (1.0 - spread / UNIFORMITY_SCALE).clamp(0.0, 1.0);
        let threshold = MIN_MATCH_DISTANCE.max(2.5 * spread);

        let mut mask = GrayImage::new(w, h);
        let mut confidence_map = GrayImage::new(w, h);
        let mut subject_pixels = 0u64;
        for (x, y, p) in rgb.enumerate_pixels() {
            let d = distance([p.0[0] as f64, p.0[1] as f64, p.0[2] as f64], mean);
            let is_background = d <= threshold;
            if !is_background {
                subject_pixels += 1;
            }
            mask.put_pixel(x, y, Luma([if is_background { 255 } else { 0 }]));
            let certainty = ((d - threshold).abs() / threshold).min(1.0);
            confidence_map.put_pixel(x, y, Luma([(certainty * 255.0) as u8]));
        }

        Ok(Segmentation {
            mask,
            confidence_map,
            subject_area: subject_pixels as f64 / (w as f64 * h as f64),
            uniformity,
            background_rgb: mean,
        })
    }

    fn replace(&self, image: &DynamicImage, mask: &GrayImage, color: [u8; 3]) -> Result<DynamicImage, StageError> {
        let mut rgb = image.to_rgb8();
        if rgb.dimensions() != mask.dimensions() {
            return Err(StageError::recoverable(
                Stage::Enhancement,
                format!(
                    "mask {:?} does not match image {:?}",
                    mask.dimensions(),
                    rgb.dimensions()
                ),
            ));
        }
        for (x, y, pixel) in rgb.enumerate_pixels_mut() {
            if mask.get_pixel(x, y).0[0] >= 128 {
                *pixel = Rgb(color);
            }
        }
        Ok(DynamicImage::ImageRgb8(rgb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Grey background with a dark square subject in the middle.
    fn portrait() -> DynamicImage {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            if (12..28).contains(&x) && (12..28).contains(&y) {
                Rgb([40, 30, 30])
            } else {
                Rgb([230, 230, 230])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_segment_flat_background() {
        let seg = BorderSegmenter::new().segment(&portrait()).unwrap();
        assert_eq!(seg.uniformity, 1.0);
        assert!((seg.subject_area - 256.0 / 1600.0).abs() < 1e-9);
        assert_eq!(seg.mask.get_pixel(0, 0).0[0], 255);
        assert_eq!(seg.mask.get_pixel(20, 20).0[0], 0);
        assert_eq!(seg.background_rgb, [230.0, 230.0, 230.0]);
    }

    #[test]
    fn test_replace_paints_background_only() {
        let segmenter = BorderSegmenter::new();
        let image = portrait();
        let seg = segmenter.segment(&image).unwrap();
        let replaced = segmenter.replace(&image, &seg.mask, [240, 240, 240]).unwrap().to_rgb8();
        assert_eq!(replaced.get_pixel(0, 0).0, [240, 240, 240]);
        assert_eq!(replaced.get_pixel(20, 20).0, [40, 30, 30]);
    }

    #[test]
    fn test_replace_rejects_mismatched_mask() {
        let err = BorderSegmenter::new()
            .replace(&portrait(), &GrayImage::new(3, 3), [0, 0, 0])
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
