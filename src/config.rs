use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::counting::DEFAULT_LINE_POSITION;
use crate::plate::DEFAULT_PLATE_PATTERN;
use crate::tracking::{
    TrackingLimits, DEFAULT_MAX_TRACKS, DEFAULT_MAX_TRAIL_POINTS, DEFAULT_TRAIL_DURATION_SECS,
};

pub const DEFAULT_VEHICLE_LABELS: &[&str] = &["car", "truck", "bus", "motorcycle", "bicycle"];
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_CAMERA_QUEUE: usize = 10;
const DEFAULT_POLL_MS: u64 = 100;

const DEFAULT_PLATE_CONFIDENCE: f32 = 0.30;
const DEFAULT_PLATE_QUEUE: usize = 5;
const DEFAULT_PLATE_MAX_PER_SEC: u32 = 90;
const DEFAULT_PLATE_MAX_SIDE: u32 = 1920;
const DEFAULT_PLATE_MIN_WIDTH: u32 = 20;
const DEFAULT_PLATE_MIN_HEIGHT: u32 = 10;
const DEFAULT_PLATE_MIN_IMAGE_SIDE: u32 = 20;

const DEFAULT_LIGHT_CONFIDENCE: f32 = 0.4;
const DEFAULT_LIGHT_QUEUE: usize = 10;
const DEFAULT_LIGHT_MAX_PER_SEC: u32 = 30;
const DEFAULT_LIGHT_MAX_SIDE: u32 = 1280;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    camera: Option<CameraConfigFile>,
    plates: Option<PlateConfigFile>,
    traffic_lights: Option<TrafficLightConfigFile>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    confidence: Option<f32>,
    labels: Option<Vec<String>>,
    line_position: Option<f32>,
    queue_capacity: Option<usize>,
    tracking: Option<bool>,
    trail_duration_secs: Option<f64>,
    max_trail_points: Option<usize>,
    max_tracks: Option<usize>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PlateConfigFile {
    enabled: Option<bool>,
    confidence: Option<f32>,
    queue_capacity: Option<usize>,
    max_per_sec: Option<u32>,
    max_side: Option<u32>,
    min_width: Option<u32>,
    min_height: Option<u32>,
    pattern: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrafficLightConfigFile {
    enabled: Option<bool>,
    confidence: Option<f32>,
    queue_capacity: Option<usize>,
    max_per_sec: Option<u32>,
    max_side: Option<u32>,
}

/// Runtime settings for every pipeline the daemon runs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub camera: CameraSettings,
    pub plates: PlateSettings,
    pub traffic_lights: TrafficLightSettings,
    /// Close camera pipelines idle for this long. Zero keeps them forever.
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub confidence: f32,
    pub labels: Vec<String>,
    pub line_position: f32,
    pub queue_capacity: usize,
    pub tracking: bool,
    pub limits: TrackingLimits,
    pub poll_interval: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            labels: DEFAULT_VEHICLE_LABELS.iter().map(|l| l.to_string()).collect(),
            line_position: DEFAULT_LINE_POSITION,
            queue_capacity: DEFAULT_CAMERA_QUEUE,
            tracking: true,
            limits: TrackingLimits::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlateSettings {
    pub enabled: bool,
    pub confidence: f32,
    pub queue_capacity: usize,
    pub max_per_sec: u32,
    /// Longer image side above which frames are downscaled first.
    pub max_side: u32,
    pub min_width: u32,
    pub min_height: u32,
    /// Images with either side below this are skipped.
    pub min_image_side: u32,
    pub pattern: String,
    pub poll_interval: Duration,
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence: DEFAULT_PLATE_CONFIDENCE,
            queue_capacity: DEFAULT_PLATE_QUEUE,
            max_per_sec: DEFAULT_PLATE_MAX_PER_SEC,
            max_side: DEFAULT_PLATE_MAX_SIDE,
            min_width: DEFAULT_PLATE_MIN_WIDTH,
            min_height: DEFAULT_PLATE_MIN_HEIGHT,
            min_image_side: DEFAULT_PLATE_MIN_IMAGE_SIDE,
            pattern: DEFAULT_PLATE_PATTERN.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrafficLightSettings {
    pub enabled: bool,
    pub confidence: f32,
    pub queue_capacity: usize,
    pub max_per_sec: u32,
    pub max_side: u32,
    pub poll_interval: Duration,
}

impl Default for TrafficLightSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence: DEFAULT_LIGHT_CONFIDENCE,
            queue_capacity: DEFAULT_LIGHT_QUEUE,
            max_per_sec: DEFAULT_LIGHT_MAX_PER_SEC,
            max_side: DEFAULT_LIGHT_MAX_SIDE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            plates: PlateSettings::default(),
            traffic_lights: TrafficLightSettings::default(),
            idle_timeout: Duration::ZERO,
        }
    }
}

impl PipelineConfig {
    /// Load from `$ROADWATCH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = Self::default();

        let cam = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            confidence: cam.confidence.unwrap_or(defaults.camera.confidence),
            labels: cam.labels.unwrap_or(defaults.camera.labels),
            line_position: cam.line_position.unwrap_or(defaults.camera.line_position),
            queue_capacity: cam.queue_capacity.unwrap_or(defaults.camera.queue_capacity),
            tracking: cam.tracking.unwrap_or(defaults.camera.tracking),
            limits: TrackingLimits {
                trail_duration_secs: cam
                    .trail_duration_secs
                    .unwrap_or(DEFAULT_TRAIL_DURATION_SECS),
                max_trail_points: cam.max_trail_points.unwrap_or(DEFAULT_MAX_TRAIL_POINTS),
                max_tracks: cam.max_tracks.unwrap_or(DEFAULT_MAX_TRACKS),
            },
            poll_interval: cam
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.camera.poll_interval),
        };

        let pl = file.plates.unwrap_or_default();
        let plates = PlateSettings {
            enabled: pl.enabled.unwrap_or(defaults.plates.enabled),
            confidence: pl.confidence.unwrap_or(defaults.plates.confidence),
            queue_capacity: pl.queue_capacity.unwrap_or(defaults.plates.queue_capacity),
            max_per_sec: pl.max_per_sec.unwrap_or(defaults.plates.max_per_sec),
            max_side: pl.max_side.unwrap_or(defaults.plates.max_side),
            min_width: pl.min_width.unwrap_or(defaults.plates.min_width),
            min_height: pl.min_height.unwrap_or(defaults.plates.min_height),
            pattern: pl.pattern.unwrap_or(defaults.plates.pattern),
            ..defaults.plates
        };

        let tl = file.traffic_lights.unwrap_or_default();
        let traffic_lights = TrafficLightSettings {
            enabled: tl.enabled.unwrap_or(defaults.traffic_lights.enabled),
            confidence: tl.confidence.unwrap_or(defaults.traffic_lights.confidence),
            queue_capacity: tl
                .queue_capacity
                .unwrap_or(defaults.traffic_lights.queue_capacity),
            max_per_sec: tl.max_per_sec.unwrap_or(defaults.traffic_lights.max_per_sec),
            max_side: tl.max_side.unwrap_or(defaults.traffic_lights.max_side),
            ..defaults.traffic_lights
        };

        Self {
            camera,
            plates,
            traffic_lights,
            idle_timeout: file
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("ROADWATCH_CONFIDENCE") {
            self.camera.confidence = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_CONFIDENCE must be a number"))?;
        }
        if let Ok(labels) = std::env::var("ROADWATCH_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.camera.labels = parsed;
            }
        }
        if let Ok(value) = std::env::var("ROADWATCH_LINE_POSITION") {
            self.camera.line_position = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_LINE_POSITION must be a number"))?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_QUEUE_CAPACITY") {
            self.camera.queue_capacity = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_QUEUE_CAPACITY must be an integer"))?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_TRACKING") {
            self.camera.tracking = parse_bool("ROADWATCH_TRACKING", &value)?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_IDLE_TIMEOUT_SECS") {
            let seconds: u64 = value.trim().parse().map_err(|_| {
                anyhow!("ROADWATCH_IDLE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.idle_timeout = Duration::from_secs(seconds);
        }
        if let Ok(value) = std::env::var("ROADWATCH_PLATES") {
            self.plates.enabled = parse_bool("ROADWATCH_PLATES", &value)?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_TRAFFIC_LIGHTS") {
            self.traffic_lights.enabled = parse_bool("ROADWATCH_TRAFFIC_LIGHTS", &value)?;
        }
        if let Ok(pattern) = std::env::var("ROADWATCH_PLATE_PATTERN") {
            if !pattern.trim().is_empty() {
                self.plates.pattern = pattern;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (name, value) in [
            ("camera confidence", self.camera.confidence),
            ("line position", self.camera.line_position),
            ("plate confidence", self.plates.confidence),
            ("traffic light confidence", self.traffic_lights.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        for (name, value) in [
            ("camera queue capacity", self.camera.queue_capacity),
            ("plate queue capacity", self.plates.queue_capacity),
            ("traffic light queue capacity", self.traffic_lights.queue_capacity),
            ("max trail points", self.camera.limits.max_trail_points),
            ("max tracks", self.camera.limits.max_tracks),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if !(self.camera.limits.trail_duration_secs > 0.0) {
            return Err(anyhow!("trail duration must be greater than zero"));
        }
        if self.camera.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }

        let mut labels: Vec<String> = Vec::new();
        for label in &self.camera.labels {
            let label = label.trim().to_lowercase();
            if !label.is_empty() && !labels.contains(&label) {
                labels.push(label);
            }
        }
        self.camera.labels = labels;
        if self.camera.labels.is_empty() {
            return Err(anyhow!("at least one vehicle label is required"));
        }

        regex::Regex::new(&self.plates.pattern)
            .map_err(|e| anyhow!("invalid plate pattern {:?}: {}", self.plates.pattern, e))?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got {:?}", name, other)),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
