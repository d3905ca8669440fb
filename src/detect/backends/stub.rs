//! Scripted backend for tests and offline runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{DetectMode, DetectionCapability, DetectorBackend};
use crate::detect::result::Detection;

const ALL_CAPABILITIES: &[DetectionCapability] = &[
    DetectionCapability::Vehicle,
    DetectionCapability::TrafficLight,
    DetectionCapability::PlateRegion,
    DetectionCapability::PlateCharacter,
];

/// Queue of per-call detection results, shareable with the test that feeds it.
#[derive(Clone, Default)]
pub struct StubScript {
    frames: Arc<Mutex<VecDeque<Vec<Detection>>>>,
    sessions: Arc<Mutex<Vec<Option<String>>>>,
}

impl StubScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result for one future `detect` call.
    pub fn push(&self, detections: Vec<Detection>) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push_back(detections);
        }
    }

    pub fn pending(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Tracking sessions seen so far, one entry per call (`None` for single-shot calls).
    pub fn sessions(&self) -> Vec<Option<String>> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next(&self, mode: DetectMode<'_>) -> Result<Vec<Detection>> {
        let session = match mode {
            DetectMode::Single => None,
            DetectMode::Track { session } => Some(session.to_string()),
        };
        self.sessions
            .lock()
            .map_err(|_| anyhow!("stub session log poisoned"))?
            .push(session);
        let mut frames = self
            .frames
            .lock()
            .map_err(|_| anyhow!("stub script poisoned"))?;
        Ok(frames.pop_front().unwrap_or_default())
    }
}

/// Stub backend for testing and `stub://` deployments.
///
/// Returns scripted detections in call order and nothing once the script runs dry.
pub struct StubBackend {
    script: StubScript,
    capabilities: Vec<DetectionCapability>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_script(StubScript::new())
    }

    pub fn with_script(script: StubScript) -> Self {
        Self {
            script,
            capabilities: ALL_CAPABILITIES.to_vec(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[DetectionCapability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn script(&self) -> StubScript {
        self.script.clone()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn detect(&mut self, _image: &RgbImage, mode: DetectMode<'_>) -> Result<Vec<Detection>> {
        self.script.next(mode)
    }
}
