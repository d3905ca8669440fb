//! Typed inbound and outbound event records.
//!
//! Inbound payloads are validated here, at the boundary; downstream code only
//! ever sees well-formed records.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detect::{BBox, Detection};
use crate::tracking::{Counters, CrossingEvent, TrackSnapshot};

pub const IMAGE_EVENT: &str = "image";
pub const VIOLATION_DETECT_EVENT: &str = "violation_detect";
pub const CAR_DETECTED_EVENT: &str = "car_detected";
pub const VIOLATION_LICENSE_PLATE_EVENT: &str = "violation_license_plate";
pub const TRAFFIC_LIGHT_EVENT: &str = "traffic_light";

/// Identifier that producers send either as a string or as a number.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum LooseId {
    Text(String),
    Int(i64),
    Float(f64),
}

impl LooseId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }
}

fn loose_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    LooseId::deserialize(deserializer).map(LooseId::into_string)
}

fn optional_loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<LooseId>::deserialize(deserializer).map(|id| id.map(LooseId::into_string))
}

/// Encoded image as carried by inbound events.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ImageBuffer {
    Base64(String),
    Bytes(Vec<u8>),
    Wrapped { image: Box<ImageBuffer> },
}

impl ImageBuffer {
    /// Encoded image bytes (JPEG, PNG, ...), base64 decoded where needed.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Base64(text) => {
                let text = strip_data_url(text.trim());
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .context("invalid base64 image buffer")
            }
            Self::Bytes(bytes) => Ok(bytes),
            Self::Wrapped { image } => image.into_bytes(),
        }
    }
}

fn strip_data_url(text: &str) -> &str {
    if text.starts_with("data:") {
        if let Some(idx) = text.find(",") {
            return &text[idx + 1..];
        }
    }
    text
}

#[derive(Debug, Deserialize)]
struct RawImageEvent {
    buffer: ImageBuffer,
    #[serde(rename = "cameraId", deserialize_with = "loose_id")]
    camera_id: String,
    #[serde(rename = "imageId", default, deserialize_with = "optional_loose_id")]
    image_id: Option<String>,
    #[serde(default)]
    created_at: Option<f64>,
    #[serde(default)]
    track_line_y: Value,
}

/// A camera frame pushed by the central server.
#[derive(Clone, Debug)]
pub struct ImageEvent {
    pub camera_id: String,
    pub image_id: Option<String>,
    /// Producer timestamp in epoch milliseconds.
    pub created_at: Option<f64>,
    /// Opaque, echoed back unchanged.
    pub track_line_y: Value,
    pub buffer: ImageBuffer,
}

impl ImageEvent {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawImageEvent =
            serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;
        let camera_id = raw.camera_id.trim().to_string();
        if camera_id.is_empty() {
            return Err(anyhow!("image event has empty cameraId"));
        }
        Ok(Self {
            camera_id,
            image_id: raw.image_id,
            created_at: raw.created_at,
            track_line_y: raw.track_line_y,
            buffer: raw.buffer,
        })
    }
}

/// Vehicle region attached to a violation, in normalized coordinates.
#[derive(Clone, Debug, Deserialize)]
pub struct VehicleRegion {
    #[serde(default, deserialize_with = "optional_loose_id")]
    pub id: Option<String>,
    pub bbox: RegionBox,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RegionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RegionBox {
    pub fn normalized(&self) -> BBox {
        BBox::new(self.x1, self.y1, self.x2, self.y2)
    }
}

#[derive(Debug, Deserialize)]
struct RawViolationEvent {
    #[serde(deserialize_with = "loose_id")]
    camera_id: String,
    #[serde(default, deserialize_with = "optional_loose_id")]
    image_id: Option<String>,
    #[serde(default)]
    violations: Value,
    buffer: ImageBuffer,
    #[serde(default)]
    detections: Vec<VehicleRegion>,
}

/// Request to read plates of vehicles involved in a violation.
#[derive(Clone, Debug)]
pub struct ViolationDetectEvent {
    pub camera_id: String,
    pub image_id: Option<String>,
    /// Opaque, echoed back unchanged.
    pub violations: Value,
    pub buffer: ImageBuffer,
    pub detections: Vec<VehicleRegion>,
}

impl ViolationDetectEvent {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawViolationEvent =
            serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;
        let camera_id = raw.camera_id.trim().to_string();
        if camera_id.is_empty() {
            return Err(anyhow!("violation_detect event has empty camera_id"));
        }
        Ok(Self {
            camera_id,
            image_id: raw.image_id,
            violations: raw.violations,
            buffer: raw.buffer,
            detections: raw.detections,
        })
    }
}

#[derive(Clone, Debug)]
pub enum InboundEvent {
    Image(ImageEvent),
    ViolationDetect(ViolationDetectEvent),
}

impl InboundEvent {
    /// Parse a payload received under the given event name.
    pub fn parse(name: &str, payload: &[u8]) -> Result<Self> {
        match name {
            IMAGE_EVENT => ImageEvent::parse(payload).map(Self::Image),
            VIOLATION_DETECT_EVENT => {
                ViolationDetectEvent::parse(payload).map(Self::ViolationDetect)
            }
            other => Err(anyhow!("unknown inbound event '{}'", other)),
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Self::Image(e) => &e.camera_id,
            Self::ViolationDetect(e) => &e.camera_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WireBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub width: f32,
    pub height: f32,
}

/// Detection as serialized in outbound payloads.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionPayload {
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    pub bbox: WireBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl From<&Detection> for DetectionPayload {
    fn from(d: &Detection) -> Self {
        Self {
            label: d.label.clone(),
            confidence: d.confidence,
            bbox: WireBox {
                x1: d.bbox.x1,
                y1: d.bbox.y1,
                x2: d.bbox.x2,
                y2: d.bbox.y2,
                width: d.bbox.width(),
                height: d.bbox.height(),
            },
            id: d.track_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VehicleCount {
    #[serde(flatten)]
    pub counters: Counters,
    /// Detections per label in this frame only.
    pub current: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CarDetected {
    pub camera_id: String,
    pub image_id: Option<String>,
    pub track_line_y: Value,
    pub detections: Vec<DetectionPayload>,
    /// Milliseconds spent in the detector.
    pub inference_time: f64,
    pub image_dimensions: ImageDimensions,
    pub created_at: Option<f64>,
    pub vehicle_count: VehicleCount,
    pub tracks: Vec<TrackSnapshot>,
    pub new_crossings: Vec<CrossingEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ViolationLicensePlate {
    pub camera_id: String,
    pub image_id: Option<String>,
    pub inference_time: f64,
    pub license_plates: BTreeMap<String, String>,
    pub violations: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrafficLight {
    #[serde(rename = "cameraId")]
    pub camera_id: String,
    #[serde(rename = "imageId")]
    pub image_id: Option<String>,
    pub traffic_status: String,
    pub detections: Vec<DetectionPayload>,
    pub inference_time: f64,
    pub image_dimensions: ImageDimensions,
    pub created_at: Option<f64>,
}

#[derive(Clone, Debug)]
pub enum OutboundEvent {
    CarDetected(CarDetected),
    ViolationLicensePlate(ViolationLicensePlate),
    TrafficLight(TrafficLight),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CarDetected(_) => CAR_DETECTED_EVENT,
            Self::ViolationLicensePlate(_) => VIOLATION_LICENSE_PLATE_EVENT,
            Self::TrafficLight(_) => TRAFFIC_LIGHT_EVENT,
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Self::CarDetected(e) => &e.camera_id,
            Self::ViolationLicensePlate(e) => &e.camera_id,
            Self::TrafficLight(e) => &e.camera_id,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::CarDetected(e) => serde_json::to_vec(e),
            Self::ViolationLicensePlate(e) => serde_json::to_vec(e),
            Self::TrafficLight(e) => serde_json::to_vec(e),
        };
        bytes.with_context(|| format!("serialize {} payload", self.name()))
    }
}

/// Destination for outbound events. Called concurrently from every worker.
pub trait EventSink: Send + Sync {
    /// Fire-and-forget; failures are the sink's to log.
    fn emit(&self, event: OutboundEvent);
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: OutboundEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_event_accepts_all_buffer_shapes() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let payloads = [
            format!(r#"{{"buffer":"{b64}","cameraId":"cam1","imageId":"i","created_at":1000,"track_line_y":0.5}}"#),
            r#"{"buffer":[1,2,3],"cameraId":"cam1","imageId":"i","created_at":1000}"#.to_string(),
            format!(r#"{{"buffer":{{"image":"{b64}"}},"cameraId":"cam1"}}"#),
            format!(r#"{{"buffer":"data:image/jpeg;base64,{b64}","cameraId":"cam1"}}"#),
        ];
        for payload in payloads {
            let event = ImageEvent::parse(payload.as_bytes()).unwrap();
            assert_eq!(event.camera_id, "cam1");
            assert_eq!(event.buffer.into_bytes().unwrap(), vec![1, 2, 3]);
        }
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let event = ImageEvent::parse(br#"{"buffer":[],"cameraId":7,"imageId":42}"#).unwrap();
        assert_eq!(event.camera_id, "7");
        assert_eq!(event.image_id.as_deref(), Some("42"));
        assert!(event.track_line_y.is_null());
    }

    #[test]
    fn empty_camera_id_is_rejected() {
        assert!(ImageEvent::parse(br#"{"buffer":[],"cameraId":"  "}"#).is_err());
        assert!(ImageEvent::parse(br#"{"buffer":[]}"#).is_err());
        assert!(ImageEvent::parse(b"not json").is_err());
    }

    #[test]
    fn violation_event_parses_regions() {
        let payload = br#"{
            "camera_id": "cam2",
            "image_id": "x",
            "violations": [{"type": "red_light"}],
            "buffer": [0],
            "detections": [
                {"id": 5, "bbox": {"x1": 0.1, "y1": 0.2, "x2": 0.5, "y2": 0.9}},
                {"bbox": {"x1": 0.0, "y1": 0.0, "x2": 1.0, "y2": 1.0}}
            ]
        }"#;
        let event = ViolationDetectEvent::parse(payload).unwrap();
        assert_eq!(event.detections.len(), 2);
        assert_eq!(event.detections[0].id.as_deref(), Some("5"));
        assert!(event.detections[1].id.is_none());
        assert_eq!(event.violations[0]["type"], "red_light");
    }

    #[test]
    fn inbound_dispatch_by_name() {
        let event = InboundEvent::parse(IMAGE_EVENT, br#"{"buffer":[],"cameraId":"a"}"#).unwrap();
        assert_eq!(event.camera_id(), "a");
        assert!(InboundEvent::parse("bogus", b"{}").is_err());
    }

    #[test]
    fn detection_payload_wire_shape() {
        let d = Detection::new("car", 0.9, BBox::new(0.1, 0.2, 0.3, 0.6)).with_track_id(3);
        let json = serde_json::to_value(DetectionPayload::from(&d)).unwrap();
        assert_eq!(json["class"], "car");
        assert_eq!(json["id"], 3);
        assert!((json["bbox"]["height"].as_f64().unwrap() - 0.4).abs() < 1e-6);

        let untracked = Detection::new("car", 0.9, BBox::new(0.1, 0.2, 0.3, 0.6));
        let json = serde_json::to_value(DetectionPayload::from(&untracked)).unwrap();
        assert!(json.get("id").is_none());
    }

    #[test]
    fn vehicle_count_flattens_counters() {
        let count = VehicleCount {
            counters: Counters::seeded(["car"]),
            current: BTreeMap::from([("car".to_string(), 2)]),
        };
        let json = serde_json::to_value(&count).unwrap();
        assert_eq!(json["total_up"], 0);
        assert_eq!(json["by_type_down"]["car"], 0);
        assert_eq!(json["current"]["car"], 2);
    }
}
