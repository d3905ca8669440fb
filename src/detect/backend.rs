//! The detector seam and the capabilities a backend can advertise.

use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Roles a backend can serve in the pipeline.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectionCapability {
    /// Vehicles in full camera frames.
    Vehicle,
    /// Traffic-light states in full camera frames.
    TrafficLight,
    /// License-plate boxes in full frames.
    PlateRegion,
    /// Individual plate characters inside a cropped plate.
    PlateCharacter,
}

/// How a single `detect` call should treat object identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectMode<'a> {
    /// Stateless detection; no track ids are expected.
    Single,
    /// Ask the backend to keep its identity assignment for `session` across
    /// calls and report track ids. The backend owns id assignment.
    Track { session: &'a str },
}

/// Detector backend trait.
///
/// Backends are opaque collaborators: models, devices and weights are their
/// own business. They are shared between worker threads behind a `Mutex`, so
/// implementations only need to be `Send`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a decoded RGB frame.
    fn detect(&mut self, image: &RgbImage, mode: DetectMode<'_>) -> Result<Vec<Detection>>;
}
