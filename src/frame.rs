//! Frame decoding and the geometry helpers the pipelines share.
//!
//! Frames travel through queues still encoded; decoding happens on the worker
//! that consumes them so the dispatch thread never pays for it.

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{GenericImageView, RgbImage};
use serde_json::Value;

use crate::detect::PixelBox;
use crate::events::ImageEvent;

// ----------------------------------------------------------------------------
// FrameJob: queued unit of work
// ----------------------------------------------------------------------------

/// An encoded frame waiting in a camera queue.
#[derive(Clone, Debug)]
pub struct FrameJob {
    pub camera_id: String,
    pub image_id: Option<String>,
    /// Producer timestamp in epoch milliseconds. Echoed only; never used for
    /// track timing.
    pub created_at: Option<f64>,
    pub track_line_y: Value,
    /// Encoded image bytes.
    pub encoded: Vec<u8>,
    /// Arrival time in epoch seconds.
    pub received_at: f64,
}

impl FrameJob {
    pub fn from_event(event: ImageEvent) -> Result<Self> {
        let encoded = event.buffer.into_bytes()?;
        if encoded.is_empty() {
            return Err(anyhow!("empty image buffer"));
        }
        Ok(Self {
            camera_id: event.camera_id,
            image_id: event.image_id,
            created_at: event.created_at,
            track_line_y: event.track_line_y,
            encoded,
            received_at: crate::now_secs(),
        })
    }

    /// Observation time in seconds for track bookkeeping: the arrival time.
    pub fn timestamp_secs(&self) -> f64 {
        self.received_at
    }

    pub fn decode(&self) -> Result<RgbImage> {
        decode(&self.encoded)
    }
}

// ----------------------------------------------------------------------------
// Decoding and resizing
// ----------------------------------------------------------------------------

/// Decode any supported still image into 8-bit RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("decode image")?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(anyhow!("decoded image has no pixels"));
    }
    Ok(image.into_rgb8())
}

/// Downscale so the longer side is at most `max_side`, keeping aspect ratio.
/// Returns the image untouched when it already fits.
pub fn fit_within(image: RgbImage, max_side: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longer = width.max(height);
    if max_side == 0 || longer <= max_side {
        return image;
    }
    let scale = max_side as f64 / longer as f64;
    let new_w = ((width as f64 * scale) as u32).max(1);
    let new_h = ((height as f64 * scale) as u32).max(1);
    imageops::resize(&image, new_w, new_h, FilterType::Triangle)
}

/// Clamp a pixel box to the image bounds.
pub fn clamp_box(b: PixelBox, width: u32, height: u32) -> PixelBox {
    PixelBox {
        x1: b.x1.min(width),
        y1: b.y1.min(height),
        x2: b.x2.min(width),
        y2: b.y2.min(height),
    }
}

/// Copy out a region of the image. Fails on an empty region.
pub fn crop(image: &RgbImage, region: PixelBox) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let region = clamp_box(region, width, height);
    if region.width() == 0 || region.height() == 0 {
        return Err(anyhow!("empty crop {:?}", region));
    }
    Ok(imageops::crop_imm(image, region.x1, region.y1, region.width(), region.height()).to_image())
}
