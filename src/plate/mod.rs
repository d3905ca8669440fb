//! License-plate association, text assembly and validation.

pub mod deskew;
pub mod worker;

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use image::RgbImage;
use regex::Regex;

use crate::detect::{BackendRegistry, DetectMode, Detection, DetectionCapability, PixelBox};
use crate::events::VehicleRegion;
use crate::frame;

pub use worker::{PlateJob, PlatePipeline, PlateProcessor};

/// National plate format: two digits, one or two letters, one to five digits.
pub const DEFAULT_PLATE_PATTERN: &str = r"^[0-9]{2}[A-Z]{1,2}[0-9]{1,5}$";
pub const MIN_PLATE_CHARS: usize = 7;
pub const MAX_PLATE_CHARS: usize = 10;
/// Max distance in pixels between a character center and the baseline
/// before a plate is treated as two-line.
pub const LINE_TOLERANCE_PX: f32 = 3.0;
pub const TWO_LINE_SEPARATOR: char = '-';

/// One recognized character, centers in crop pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateCharacter {
    pub x_center: f32,
    pub y_center: f32,
    pub label: String,
}

impl PlateCharacter {
    pub fn new(x_center: f32, y_center: f32, label: impl Into<String>) -> Self {
        Self {
            x_center,
            y_center,
            label: label.into(),
        }
    }
}

/// Outcome of reading one plate crop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlateRead {
    Text(String),
    /// The recognizer failed on this crop.
    Unreadable,
    Rejected(String),
}

impl PlateRead {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

fn reading_order(a: &PlateCharacter, b: &PlateCharacter) -> std::cmp::Ordering {
    a.x_center
        .total_cmp(&b.x_center)
        .then_with(|| a.label.cmp(&b.label))
        .then_with(|| a.y_center.total_cmp(&b.y_center))
}

fn join_labels(chars: &[&PlateCharacter]) -> String {
    chars.iter().map(|c| c.label.as_str()).collect()
}

/// Assemble recognized characters into plate text.
///
/// Characters are laid out along the line through the leftmost and rightmost
/// centers. If any center strays more than [`LINE_TOLERANCE_PX`] from it the
/// plate is read as two lines, split at the mean center height.
pub fn read_plate(chars: &[PlateCharacter]) -> PlateRead {
    if chars.len() < MIN_PLATE_CHARS || chars.len() > MAX_PLATE_CHARS {
        return PlateRead::Rejected(format!(
            "{} characters, expected {}..={}",
            chars.len(),
            MIN_PLATE_CHARS,
            MAX_PLATE_CHARS
        ));
    }

    let mut sorted: Vec<&PlateCharacter> = chars.iter().collect();
    sorted.sort_by(|a, b| reading_order(a, b));
    let left = sorted[0];
    let right = sorted[sorted.len() - 1];

    let two_line = left.x_center != right.x_center
        && sorted.iter().any(|c| {
            let slope = (right.y_center - left.y_center) / (right.x_center - left.x_center);
            let expected = left.y_center + slope * (c.x_center - left.x_center);
            (expected - c.y_center).abs() > LINE_TOLERANCE_PX
        });

    if !two_line {
        return PlateRead::Text(join_labels(&sorted));
    }

    let y_sum: f32 = sorted.iter().map(|c| c.y_center).sum();
    let y_mean = (y_sum.floor() / sorted.len() as f32).floor();
    let (lower, upper): (Vec<&PlateCharacter>, Vec<&PlateCharacter>) =
        sorted.iter().copied().partition(|c| c.y_center.floor() > y_mean);
    let mut text = join_labels(&upper);
    text.push(TWO_LINE_SEPARATOR);
    text.push_str(&join_labels(&lower));
    PlateRead::Text(text)
}

/// Accepts only plate texts matching the configured national format.
#[derive(Clone, Debug)]
pub struct PlateValidator {
    pattern: Regex,
}

impl PlateValidator {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern =
            Regex::new(pattern).map_err(|e| anyhow!("invalid plate pattern {:?}: {}", pattern, e))?;
        Ok(Self { pattern })
    }

    pub fn is_valid(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Drop every entry whose text does not match.
    pub fn retain_valid(&self, plates: BTreeMap<String, String>) -> BTreeMap<String, String> {
        plates
            .into_iter()
            .filter(|(vehicle, text)| {
                let ok = self.is_valid(text);
                if !ok {
                    log::debug!("plate {:?} for vehicle {} filtered", text, vehicle);
                }
                ok
            })
            .collect()
    }
}

/// A plate-detector hit, clamped to the working image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlateCandidate {
    pub region: PixelBox,
    pub confidence: f32,
}

/// Vehicle region scaled to the working image.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaledRegion {
    pub vehicle_id: String,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl ScaledRegion {
    /// Regions without an id cannot be reported and are skipped.
    pub fn scale_all(regions: &[VehicleRegion], width: u32, height: u32) -> Vec<Self> {
        regions
            .iter()
            .filter_map(|region| {
                let vehicle_id = region.id.clone()?;
                let b = region.bbox.normalized();
                Some(Self {
                    vehicle_id,
                    x1: b.x1 * width as f32,
                    y1: b.y1 * height as f32,
                    x2: b.x2 * width as f32,
                    y2: b.y2 * height as f32,
                })
            })
            .collect()
    }

    pub fn contains(&self, plate: &PixelBox) -> bool {
        plate.x1 as f32 >= self.x1
            && plate.x2 as f32 <= self.x2
            && plate.y1 as f32 >= self.y1
            && plate.y2 as f32 <= self.y2
    }
}

/// Thresholds for plate-region candidates.
#[derive(Clone, Copy, Debug)]
pub struct CandidateFilter {
    pub min_confidence: f32,
    pub min_width: u32,
    pub min_height: u32,
}

impl CandidateFilter {
    /// Confident, large-enough plate boxes in pixel coordinates of a
    /// `width` x `height` image.
    pub fn candidates(&self, detections: &[Detection], width: u32, height: u32) -> Vec<PlateCandidate> {
        detections
            .iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .filter_map(|d| {
                let x = to_px(d.bbox.x1 * width as f32);
                let y = to_px(d.bbox.y1 * height as f32);
                let w = to_px(d.bbox.width() * width as f32);
                let h = to_px(d.bbox.height() * height as f32);
                let w = w.min(width.saturating_sub(x));
                let h = h.min(height.saturating_sub(y));
                if w < self.min_width || h < self.min_height {
                    return None;
                }
                Some(PlateCandidate {
                    region: PixelBox {
                        x1: x,
                        y1: y,
                        x2: x + w,
                        y2: y + h,
                    },
                    confidence: d.confidence,
                })
            })
            .collect()
    }
}

// truncate like the detector's pixel output, absorbing normalization error
fn to_px(v: f32) -> u32 {
    (v + 1e-3).max(0.0) as u32
}

/// First region that fully contains the plate.
pub fn associate<'a>(plate: &PlateCandidate, regions: &'a [ScaledRegion]) -> Option<&'a ScaledRegion> {
    regions.iter().find(|r| r.contains(&plate.region))
}

/// Runs plate detection and OCR through the detector registry.
#[derive(Clone)]
pub struct PlateReader {
    detectors: BackendRegistry,
    filter: CandidateFilter,
}

impl PlateReader {
    pub fn new(detectors: BackendRegistry, filter: CandidateFilter) -> Self {
        Self { detectors, filter }
    }

    fn characters(&self, crop: &RgbImage) -> Result<Vec<PlateCharacter>> {
        let (width, height) = crop.dimensions();
        let detections = self.detectors.detect_with_capability(
            DetectionCapability::PlateCharacter,
            crop,
            DetectMode::Single,
        )?;
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= self.filter.min_confidence)
            .map(|d| {
                PlateCharacter::new(
                    (d.bbox.x1 + d.bbox.x2) / 2.0 * width as f32,
                    (d.bbox.y1 + d.bbox.y2) / 2.0 * height as f32,
                    d.label,
                )
            })
            .collect())
    }

    fn read_variant(&self, crop: &RgbImage) -> PlateRead {
        match self.characters(crop) {
            Ok(chars) => read_plate(&chars),
            Err(err) => {
                log::warn!("plate ocr failed: {:#}", err);
                PlateRead::Unreadable
            }
        }
    }

    /// Read a crop as-is, then deskewed, then deskewed on a contrast-enhanced
    /// copy. The first readable variant wins.
    pub fn read_crop(&self, crop: &RgbImage) -> PlateRead {
        let mut outcome = self.read_variant(crop);
        if outcome.text().is_some() {
            return outcome;
        }
        for enhance_contrast in [false, true] {
            outcome = self.read_variant(&deskew::deskew(crop, enhance_contrast));
            if outcome.text().is_some() {
                break;
            }
        }
        outcome
    }

    /// Plate text per vehicle id. Unvalidated; later reads for the same
    /// vehicle overwrite earlier ones.
    pub fn recognize(&self, image: &RgbImage, regions: &[VehicleRegion]) -> Result<BTreeMap<String, String>> {
        let (width, height) = image.dimensions();
        let plates = self.detectors.detect_with_capability(
            DetectionCapability::PlateRegion,
            image,
            DetectMode::Single,
        )?;
        let regions = ScaledRegion::scale_all(regions, width, height);

        let mut read = BTreeMap::new();
        for candidate in self.filter.candidates(&plates, width, height) {
            let Some(vehicle) = associate(&candidate, &regions) else {
                continue;
            };
            let crop = match frame::crop(image, candidate.region) {
                Ok(crop) => crop,
                Err(err) => {
                    log::warn!("plate crop skipped: {:#}", err);
                    continue;
                }
            };
            match self.read_crop(&crop) {
                PlateRead::Text(text) => {
                    read.insert(vehicle.vehicle_id.clone(), text);
                }
                PlateRead::Rejected(reason) => {
                    log::debug!("plate for vehicle {} rejected: {}", vehicle.vehicle_id, reason)
                }
                PlateRead::Unreadable => {
                    log::debug!("plate for vehicle {} unreadable", vehicle.vehicle_id)
                }
            }
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;
    use crate::events::RegionBox;

    fn row(labels: &str, y: f32) -> Vec<PlateCharacter> {
        labels
            .chars()
            .enumerate()
            .map(|(i, c)| PlateCharacter::new(10.0 + i as f32 * 12.0, y, c.to_string()))
            .collect()
    }

    #[test]
    fn single_line_sorted_by_x() {
        let mut chars = row("29A12345", 20.0);
        chars.reverse();
        assert_eq!(read_plate(&chars), PlateRead::Text("29A12345".into()));
    }

    #[test]
    fn character_count_bounds() {
        assert!(matches!(read_plate(&row("29A1234", 20.0)), PlateRead::Text(_)));
        assert!(matches!(read_plate(&row("29A123", 20.0)), PlateRead::Rejected(_)));
        assert!(matches!(read_plate(&row("29A1234567", 20.0)), PlateRead::Text(_)));
        assert!(matches!(read_plate(&row("29A12345678", 20.0)), PlateRead::Rejected(_)));
        assert!(matches!(read_plate(&[]), PlateRead::Rejected(_)));
    }

    #[test]
    fn small_wobble_stays_single_line() {
        let mut chars = row("29A12345", 20.0);
        chars[3].y_center += 2.5;
        assert_eq!(read_plate(&chars), PlateRead::Text("29A12345".into()));
    }

    #[test]
    fn two_line_plate_uses_separator() {
        // upper: 29A1 at y=10, lower: 2345 at y=30, interleaved in x
        let mut chars = Vec::new();
        for (i, c) in "29A1".chars().enumerate() {
            chars.push(PlateCharacter::new(5.0 + i as f32 * 20.0, 10.0, c.to_string()));
        }
        for (i, c) in "2345".chars().enumerate() {
            chars.push(PlateCharacter::new(10.0 + i as f32 * 20.0, 30.0, c.to_string()));
        }
        assert_eq!(read_plate(&chars), PlateRead::Text("29A1-2345".into()));
    }

    #[test]
    fn one_displaced_character_forces_two_lines() {
        let mut chars = row("29A12345", 20.0);
        chars[4].y_center += 10.0;
        let text = read_plate(&chars);
        assert_eq!(text, PlateRead::Text("29A1345-2".into()));
        assert!(text.text().unwrap().contains(TWO_LINE_SEPARATOR));
    }

    #[test]
    fn assembly_ignores_input_order() {
        let base = row("51AB12345", 20.0);
        let expected = read_plate(&base);
        for shift in 1..base.len() {
            let mut rotated = base.clone();
            rotated.rotate_left(shift);
            assert_eq!(read_plate(&rotated), expected);
        }
        let mut reversed = base.clone();
        reversed.reverse();
        assert_eq!(read_plate(&reversed), expected);
    }

    #[test]
    fn validator_default_pattern() {
        let v = PlateValidator::new(DEFAULT_PLATE_PATTERN).unwrap();
        assert!(v.is_valid("29A12345"));
        assert!(v.is_valid("51AB1"));
        assert!(!v.is_valid("AB1234"));
        assert!(!v.is_valid("29A1-2345"));
        assert!(PlateValidator::new("[").is_err());
    }

    #[test]
    fn candidates_filtered_and_clamped() {
        let filter = CandidateFilter {
            min_confidence: 0.3,
            min_width: 20,
            min_height: 10,
        };
        let detections = vec![
            Detection::new("plate", 0.9, BBox::from_pixels(10.0, 10.0, 50.0, 30.0, 100, 100)),
            Detection::new("plate", 0.2, BBox::from_pixels(10.0, 10.0, 50.0, 30.0, 100, 100)),
            Detection::new("plate", 0.9, BBox::from_pixels(10.0, 10.0, 25.0, 30.0, 100, 100)),
            Detection::new("plate", 0.9, BBox::from_pixels(85.0, 50.0, 120.0, 70.0, 100, 100)),
        ];
        let c = filter.candidates(&detections, 100, 100);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].region, PixelBox { x1: 10, y1: 10, x2: 50, y2: 30 });
    }

    #[test]
    fn association_requires_full_containment() {
        let regions = ScaledRegion::scale_all(
            &[
                VehicleRegion {
                    id: None,
                    bbox: RegionBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
                },
                VehicleRegion {
                    id: Some("7".into()),
                    bbox: RegionBox { x1: 0.1, y1: 0.1, x2: 0.5, y2: 0.5 },
                },
            ],
            100,
            100,
        );
        assert_eq!(regions.len(), 1);
        let inside = PlateCandidate {
            region: PixelBox { x1: 10, y1: 20, x2: 50, y2: 40 },
            confidence: 0.9,
        };
        let straddling = PlateCandidate {
            region: PixelBox { x1: 40, y1: 20, x2: 60, y2: 40 },
            confidence: 0.9,
        };
        assert_eq!(associate(&inside, &regions).map(|r| r.vehicle_id.as_str()), Some("7"));
        assert!(associate(&straddling, &regions).is_none());
    }
}
