//! Skew correction for plate crops.
//!
//! The skew angle is the rotation that makes the horizontal projection profile
//! of the crop sharpest: character rows line up, so row sums jump hard at the
//! top and bottom of each text line.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::contrast;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::stats::percentile;

pub const MAX_SKEW_DEGREES: i32 = 15;

/// Rotate `image` clockwise about its center by `degrees`, keeping its
/// dimensions. Uncovered corners take the mean border color.
pub fn rotate(image: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    if degrees == 0.0 || width == 0 || height == 0 {
        return image.clone();
    }
    rotate_about_center(
        image,
        degrees.to_radians(),
        Interpolation::Bilinear,
        border_mean(image),
    )
}

fn border_mean(image: &RgbImage) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for (x, y, p) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            for c in 0..3 {
                sum[c] += p[c] as u64;
            }
            count += 1;
        }
    }
    let count = count.max(1);
    Rgb([
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
    ])
}

/// Linear contrast stretch between the 1st and 99th luminance percentiles.
pub fn stretch_contrast(gray: &GrayImage) -> GrayImage {
    if gray.width() == 0 || gray.height() == 0 {
        return gray.clone();
    }
    let low = percentile(gray, 1);
    let high = percentile(gray, 99);
    if high <= low {
        return gray.clone();
    }
    contrast::stretch_contrast(gray, low, high, 0, 255)
}

/// Angle in whole degrees within ±`MAX_SKEW_DEGREES` that, passed to
/// [`rotate`], straightens the text. Ties go to the smaller rotation.
pub fn estimate_skew(gray: &GrayImage) -> f32 {
    let (width, height) = gray.dimensions();
    if width < 2 || height < 2 {
        return 0.0;
    }
    let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / (width * height) as f64;
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let diag = ((width * width + height * height) as f32).sqrt();
    let bins = diag.ceil() as usize + 2;
    let offset = diag / 2.0 + 1.0;

    let mut best_angle = 0;
    let mut best_score = f64::MIN;
    let mut angles: Vec<i32> = (-MAX_SKEW_DEGREES..=MAX_SKEW_DEGREES).collect();
    angles.sort_by_key(|a| a.abs());
    for angle in angles {
        let (sin, cos) = (angle as f32).to_radians().sin_cos();
        let mut profile = vec![0f64; bins];
        for (x, y, p) in gray.enumerate_pixels() {
            let weight = (p[0] as f64 - mean).abs();
            if weight == 0.0 {
                continue;
            }
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let row = sin * dx + cos * dy + offset;
            let bin = (row.max(0.0) as usize).min(bins - 1);
            profile[bin] += weight;
        }
        let score: f64 = profile.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
    }
    best_angle as f32
}

/// Straighten a crop. With `enhance_contrast` the angle is estimated on a
/// contrast-stretched copy; the returned pixels are always the original ones.
pub fn deskew(image: &RgbImage, enhance_contrast: bool) -> RgbImage {
    let gray = image::imageops::grayscale(image);
    let gray = if enhance_contrast {
        stretch_contrast(&gray)
    } else {
        gray
    };
    rotate(image, estimate_skew(&gray))
}
