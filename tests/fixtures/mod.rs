//! Synthetic portrait fixtures written to a temp directory at test time

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb, RgbImage};

/// Description of a generated input image.
///
/// The mock quality analyzer scores an image by the red channel of its first
/// pixel, so `red` controls how far from converged the portrait starts.
#[derive(Debug, Clone, Copy)]
pub struct PortraitFixture {
    pub filename: &'static str,
    pub width: u32,
    pub height: u32,
    pub red: u8,
    pub description: &'static str,
}

pub const STANDARD: PortraitFixture = PortraitFixture {
    filename: "standard.png",
    width: 120,
    height: 150,
    red: 255,
    description: "Fully bright portrait, scores 1.0 on first pass",
};

pub const DIM: PortraitFixture = PortraitFixture {
    filename: "dim.png",
    width: 120,
    height: 150,
    red: 230,
    description: "Needs two +10 brightening passes to clear 0.95",
};

pub const THUMBNAIL: PortraitFixture = PortraitFixture {
    filename: "thumbnail.png",
    width: 48,
    height: 60,
    red: 255,
    description: "Below the 100px minimum dimension",
};

/// Write `fixture` into `dir` and return its path.
pub fn write(dir: &Path, fixture: &PortraitFixture) -> PathBuf {
    let image = RgbImage::from_pixel(fixture.width, fixture.height, Rgb([fixture.red, 200, 180]));
    let path = dir.join(fixture.filename);
    DynamicImage::ImageRgb8(image)
        .save(&path)
        .unwrap_or_else(|e| panic!("failed to write fixture {}: {e}", fixture.description));
    path
}
