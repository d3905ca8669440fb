#![cfg(feature = "backend-http")]
//! Remote detection over HTTP.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::detect::backend::{DetectMode, DetectionCapability, DetectorBackend};
use crate::detect::result::{BBox, Detection};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Detector backend that delegates inference to a remote detection service.
///
/// The service receives a base64 JPEG and answers with labeled boxes, either in
/// pixels (`x1..y2`) or already normalized (`x1_rel..y2_rel`).
pub struct HttpBackend {
    url: String,
    capabilities: Vec<DetectionCapability>,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: String,
    track: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RemoteDetection>,
}

#[derive(Deserialize)]
struct RemoteDetection {
    #[serde(rename = "class")]
    label: String,
    confidence: f32,
    bbox: RemoteBox,
    #[serde(default)]
    id: Option<i64>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RemoteBox {
    x1: Option<f32>,
    y1: Option<f32>,
    x2: Option<f32>,
    y2: Option<f32>,
    x1_rel: Option<f32>,
    y1_rel: Option<f32>,
    x2_rel: Option<f32>,
    y2_rel: Option<f32>,
}

impl RemoteBox {
    /// Normalized box; relative coordinates win when both sets are complete.
    fn normalize(&self, width: u32, height: u32) -> Result<BBox> {
        if let (Some(x1), Some(y1), Some(x2), Some(y2)) =
            (self.x1_rel, self.y1_rel, self.x2_rel, self.y2_rel)
        {
            return Ok(BBox::new(x1, y1, x2, y2));
        }
        match (self.x1, self.y1, self.x2, self.y2) {
            (Some(x1), Some(y1), Some(x2), Some(y2)) => {
                Ok(BBox::from_pixels(x1, y1, x2, y2, width, height))
            }
            _ => Err(anyhow!("bbox carries neither pixel nor relative coordinates")),
        }
    }
}

fn parse_response(text: &str, width: u32, height: u32, track: bool) -> Result<Vec<Detection>> {
    let parsed: DetectResponse = serde_json::from_str(text)?;
    parsed
        .detections
        .into_iter()
        .map(|remote| {
            let bbox = remote.bbox.normalize(width, height)?;
            let mut detection = Detection::new(remote.label, remote.confidence, bbox);
            if track {
                detection.track_id = remote.id;
            }
            Ok(detection)
        })
        .collect()
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, capabilities: &[DetectionCapability]) -> Self {
        Self {
            url: url.into(),
            capabilities: capabilities.to_vec(),
        }
    }

    fn encode(image: &RgbImage) -> Result<String> {
        let mut jpeg = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .context("encode frame as jpeg")?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }
}

impl DetectorBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn detect(&mut self, image: &RgbImage, mode: DetectMode<'_>) -> Result<Vec<Detection>> {
        let (track, session) = match mode {
            DetectMode::Single => (false, None),
            DetectMode::Track { session } => (true, Some(session)),
        };
        let request = DetectRequest {
            image: Self::encode(image)?,
            track,
            session,
        };
        let body = serde_json::to_string(&request)?;
        let response = ureq::post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .with_context(|| format!("detection request to {}", self.url))?;
        let text = response
            .into_string()
            .context("read detection response")?;
        let (width, height) = image.dimensions();
        parse_response(&text, width, height, track)
            .with_context(|| format!("invalid detection response from {}", self.url))
    }
}
