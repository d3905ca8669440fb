//! Backend registration and capability routing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::result::Detection;

use super::backend::{DetectMode, DetectionCapability, DetectorBackend};

/// Backend handle shared across worker threads.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`;
/// concurrent camera workers therefore serialize on a shared backend.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    assigned: HashMap<DetectionCapability, String>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            assigned: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend under its own name. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        self.register_as(&name, backend);
    }

    /// Register a backend under an explicit name, e.g. one per model.
    pub fn register_as<B: DetectorBackend + 'static>(&mut self, name: &str, backend: B) {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.backends
            .insert(name.to_string(), Arc::new(Mutex::new(backend)));
    }

    /// Pin a capability to a named backend.
    pub fn assign(&mut self, capability: DetectionCapability, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.assigned.insert(capability, name.to_string());
        Ok(())
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Select a backend for the requested capability.
    ///
    /// An explicit assignment wins; otherwise the default backend is preferred
    /// when it supports the capability, then any other supporting backend.
    pub fn backend_for_capability(&self, capability: DetectionCapability) -> Result<SharedBackend> {
        if let Some(name) = self.assigned.get(&capability) {
            return self
                .get(name)
                .ok_or_else(|| anyhow!("backend '{}' not registered", name));
        }

        if let Some(default_backend) = self.default_backend() {
            let supports = {
                let guard = default_backend
                    .lock()
                    .map_err(|_| anyhow!("default backend lock poisoned"))?;
                guard.supports(capability)
            };
            if supports {
                return Ok(default_backend);
            }
        }

        for name in self.list() {
            let Some(backend) = self.get(&name) else {
                continue;
            };
            let supports = {
                let guard = backend
                    .lock()
                    .map_err(|_| anyhow!("backend lock poisoned"))?;
                guard.supports(capability)
            };
            if supports {
                return Ok(backend);
            }
        }

        Err(anyhow!(
            "no registered backend supports capability {:?}",
            capability
        ))
    }

    /// Run detection using a backend that supports the requested capability.
    pub fn detect_with_capability(
        &self,
        capability: DetectionCapability,
        image: &RgbImage,
        mode: DetectMode<'_>,
    ) -> Result<Vec<Detection>> {
        let backend = self.backend_for_capability(capability)?;
        run_backend(&backend, image, mode)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a shared backend and run one detection.
pub fn run_backend(
    backend: &SharedBackend,
    image: &RgbImage,
    mode: DetectMode<'_>,
) -> Result<Vec<Detection>> {
    let mut guard = backend
        .lock()
        .map_err(|_| anyhow!("backend lock poisoned"))?;
    guard.detect(image, mode)
}
