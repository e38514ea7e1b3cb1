use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Inclusive acceptance range: a measurement passes when `min <= measured <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    /// Band of `target ± tolerance`.
    pub fn new(target: f64, tolerance: f64) -> Self {
        Self {
            min: target - tolerance,
            max: target + tolerance,
        }
    }

    pub const fn between(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Band for a signed magnitude that must stay within `-max..=max`.
    pub fn at_most(max: f64) -> Self {
        Self { min: -max, max }
    }

    /// Band for a score that must reach `min`; scores are bounded by 1.
    pub const fn at_least(min: f64) -> Self {
        Self { min, max: 1.0 }
    }

    pub fn contains(&self, measured: f64) -> bool {
        self.min <= measured && measured <= self.max
    }

    pub fn half_width(&self) -> f64 {
        (self.max - self.min) / 2.0
    }

    /// Distance from the nearest edge, 0 inside the band.
    pub fn excess(&self, measured: f64) -> f64 {
        if measured < self.min {
            self.min - measured
        } else if measured > self.max {
            measured - self.max
        } else {
            0.0
        }
    }
}

/// Geometry, background and quality rules for one photo format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatRules {
    pub id: String,
    pub display_name: String,
    /// Face height as a fraction of image height.
    pub face_height_ratio: Band,
    /// Eye line distance from the top as a fraction of image height.
    pub eye_line_ratio: Band,
    /// Horizontal offset of the face centre from the image centre, fraction of width.
    pub center_offset: Band,
    /// Largest of |yaw|, |pitch|, |roll| in degrees.
    pub head_rotation_deg: Band,
    pub background_rgb: [u8; 3],
    /// Euclidean RGB distance from `background_rgb`.
    pub background_distance: Band,
    pub min_background_uniformity: f64,
    /// Detector-reported face quality, expected near 1.0.
    pub face_quality: Band,
    pub max_compression_artifacts: f64,
    #[serde(default)]
    pub dimensions: Option<(u32, u32)>,
}

impl FormatRules {
    /// ICAO Doc 9303 style portrait rules.
    pub fn icao() -> Self {
        Self {
            id: "icao".to_string(),
            display_name: "ICAO 9303 portrait".to_string(),
            face_height_ratio: Band::between(0.62, 0.69),
            eye_line_ratio: Band::between(0.33, 0.36),
            center_offset: Band::at_most(0.03),
            head_rotation_deg: Band::at_most(2.0),
            background_rgb: [240, 240, 240],
            background_distance: Band::at_most(15.0),
            min_background_uniformity: 0.85,
            face_quality: Band::new(1.0, 0.2),
            max_compression_artifacts: 0.1,
            dimensions: None,
        }
    }

    /// 2x2 inch US passport photo at 300 dpi.
    pub fn us_passport() -> Self {
        Self {
            id: "us_passport".to_string(),
            display_name: "US passport 2x2in".to_string(),
            face_height_ratio: Band::between(0.50, 0.69),
            eye_line_ratio: Band::between(0.31, 0.44),
            center_offset: Band::at_most(0.05),
            head_rotation_deg: Band::at_most(5.0),
            background_rgb: [255, 255, 255],
            background_distance: Band::at_most(20.0),
            min_background_uniformity: 0.8,
            face_quality: Band::new(1.0, 0.25),
            max_compression_artifacts: 0.15,
            dimensions: Some((600, 600)),
        }
    }
}

/// Lookup of format rules by format id.
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    formats: HashMap<String, FormatRules>,
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self {
            formats: HashMap::new(),
        }
    }

    pub fn insert(&mut self, rules: FormatRules) {
        self.formats.insert(rules.id.clone(), rules);
    }

    pub fn get(&self, id: &str) -> Option<&FormatRules> {
        self.formats.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.formats.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.formats.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.insert(FormatRules::icao());
        registry.insert(FormatRules::us_passport());
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_between() {
        let band = Band::between(2.0, 6.0);
        assert!(band.contains(2.0));
        assert!(band.contains(6.0));
        assert!(!band.contains(6.000001));
        assert_eq!(band.half_width(), 2.0);
        assert_eq!(band.excess(7.0), 1.0);
        assert_eq!(band.excess(1.5), 0.5);
        assert_eq!(band.excess(4.0), 0.0);
    }

    #[test]
    fn test_builtin_formats() {
        let registry = FormatRegistry::default();
        assert_eq!(registry.ids(), vec!["icao", "us_passport"]);
        assert!(registry.get("unknown").is_none());
    }
}
