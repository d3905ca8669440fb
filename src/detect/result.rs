//! Detection results in normalized coordinates.

use serde::Serialize;

/// Axis-aligned box in normalized image coordinates.
///
/// Construction always clamps into `[0, 1]` and orders the corners, so every
/// `BBox` satisfies `0 <= x1 <= x2 <= 1` and `0 <= y1 <= y2 <= 1`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, x2) = ordered(clamp_unit(x1), clamp_unit(x2));
        let (y1, y2) = ordered(clamp_unit(y1), clamp_unit(y2));
        Self { x1, y1, x2, y2 }
    }

    /// Normalize a pixel-space box against the frame dimensions.
    pub fn from_pixels(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self::new(x1 / w, y1 / h, x2 / w, y2 / h)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Scale back to whole pixels for a frame of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelBox {
        let w = width as f32;
        let h = height as f32;
        PixelBox {
            x1: (self.x1 * w).round() as u32,
            y1: (self.y1 * h).round() as u32,
            x2: (self.x2 * w).round() as u32,
            y2: (self.y2 * h).round() as u32,
        }
    }
}

/// Box in whole pixels of a specific frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Integer center, matching how trails are plotted by consumers.
    pub fn center(&self) -> (f32, f32) {
        (
            ((self.x1 + self.x2) / 2) as f32,
            ((self.y1 + self.y2) / 2) as f32,
        )
    }
}

/// One labeled, scored box produced by a detector backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// Persistent identity, only present when the backend ran in tracking mode.
    pub track_id: Option<i64>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            track_id: None,
        }
    }

    pub fn with_track_id(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_is_clamped_and_ordered() {
        let b = BBox::new(1.4, 0.8, -0.2, 0.1);
        assert_eq!(b.x1, 0.0);
        assert_eq!(b.x2, 1.0);
        assert_eq!(b.y1, 0.1);
        assert_eq!(b.y2, 0.8);
    }

    #[test]
    fn pixel_roundtrip_center() {
        let b = BBox::from_pixels(10.0, 35.0, 30.0, 45.0, 100, 100);
        let px = b.to_pixels(100, 100);
        assert_eq!(px, PixelBox { x1: 10, y1: 35, x2: 30, y2: 45 });
        assert_eq!(px.center(), (20.0, 40.0));
    }
}
