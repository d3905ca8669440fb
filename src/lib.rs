//! Roadwatch: real-time traffic analytics for camera frames.
//!
//! Frames arrive over MQTT, are queued per camera and run through object
//! detection. Tracked vehicles are counted when they cross a horizontal
//! line; results are published back as events.
//!
//! # Module Structure
//!
//! - `detect`: detector backends and the registry that selects them
//! - `counting`: line-crossing geometry
//! - `tracking`: per-camera track history, crossings and counters
//! - `pipeline`: bounded per-camera queues, workers and their manager
//! - `plate`: license-plate association, reading and validation
//! - `traffic_light`: traffic-light state detection
//! - `events`: inbound and outbound wire payloads, event sinks
//! - `transport`: MQTT connection management
//! - `service`: inbound dispatch to the pipelines
//! - `config`: pipeline settings from file and environment

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod counting;
pub mod detect;
pub mod events;
pub mod frame;
pub mod pipeline;
pub mod plate;
pub mod service;
pub mod tracking;
pub mod traffic_light;
pub mod transport;

pub use config::{CameraSettings, PipelineConfig, PlateSettings, TrafficLightSettings};
pub use counting::{CountingLine, Direction};
pub use detect::{BBox, BackendRegistry, DetectMode, Detection, DetectionCapability, DetectorBackend};
pub use events::{EventSink, InboundEvent, OutboundEvent, RecordingSink};
pub use frame::FrameJob;
pub use pipeline::{PipelineManager, RouteOutcome};
pub use service::ServiceContext;
pub use tracking::{Counters, CrossingEvent, TrackRegistry};

/// Process-wide stop signal observed by every worker at its poll boundary.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
