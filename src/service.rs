//! Inbound event dispatch: routes frames and violations to their pipelines.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::PipelineConfig;
use crate::detect::BackendRegistry;
use crate::events::{EventSink, InboundEvent};
use crate::frame::FrameJob;
use crate::pipeline::{Admission, PipelineManager, RouteOutcome};
use crate::plate::PlatePipeline;
use crate::traffic_light::TrafficLightPipeline;
use crate::transport::InboundHandler;
use crate::ShutdownFlag;

/// Everything that consumes inbound events, wired to one sink.
pub struct ServiceContext {
    manager: PipelineManager,
    plates: Option<Mutex<PlatePipeline>>,
    traffic_lights: Option<Mutex<TrafficLightPipeline>>,
    idle_timeout: Duration,
}

impl ServiceContext {
    pub fn new(
        config: PipelineConfig,
        detectors: BackendRegistry,
        sink: Arc<dyn EventSink>,
        shutdown: ShutdownFlag,
    ) -> Result<Self> {
        let plates = if config.plates.enabled {
            Some(Mutex::new(PlatePipeline::spawn(
                config.plates,
                detectors.clone(),
                Arc::clone(&sink),
                shutdown.clone(),
            )?))
        } else {
            None
        };
        let traffic_lights = if config.traffic_lights.enabled {
            Some(Mutex::new(TrafficLightPipeline::spawn(
                config.traffic_lights,
                detectors.clone(),
                Arc::clone(&sink),
                shutdown.clone(),
            )))
        } else {
            None
        };
        let manager = PipelineManager::new(config.camera, detectors, sink, shutdown);
        Ok(Self {
            manager,
            plates,
            traffic_lights,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn manager(&self) -> &PipelineManager {
        &self.manager
    }

    pub fn plates_enabled(&self) -> bool {
        self.plates.is_some()
    }

    pub fn traffic_lights_enabled(&self) -> bool {
        self.traffic_lights.is_some()
    }

    /// Parse and route one inbound event.
    pub fn dispatch(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Image(image) => {
                let job = FrameJob::from_event(image)?;
                if let Some(lights) = &self.traffic_lights {
                    let admission = lights
                        .lock()
                        .map_err(|_| anyhow!("traffic light pipeline poisoned"))?
                        .submit(&job)?;
                    if admission != Admission::Enqueued {
                        log::debug!(
                            "[camera {}] traffic light frame {:?}",
                            job.camera_id,
                            admission
                        );
                    }
                }
                let camera_id = job.camera_id.clone();
                match self.manager.route(job)? {
                    RouteOutcome::Enqueued => {}
                    RouteOutcome::Dropped => {
                        log::debug!("[camera {}] queue full, frame dropped", camera_id)
                    }
                    RouteOutcome::ShuttingDown => {
                        log::debug!("[camera {}] shutting down, frame ignored", camera_id)
                    }
                }
            }
            InboundEvent::ViolationDetect(violation) => match &self.plates {
                Some(plates) => {
                    plates
                        .lock()
                        .map_err(|_| anyhow!("plate pipeline poisoned"))?
                        .submit(violation)?;
                }
                None => log::debug!(
                    "[camera {}] plate recognition disabled, violation ignored",
                    violation.camera_id
                ),
            },
        }
        Ok(())
    }

    /// Stop cameras idle longer than the configured timeout.
    pub fn evict_idle(&self) -> Result<Vec<String>> {
        self.manager.evict_idle(self.idle_timeout)
    }

    /// Join every worker. Callers set the shutdown flag first or this
    /// triggers it through the manager.
    pub fn shutdown(&self) -> Result<()> {
        self.manager.shutdown()?;
        if let Some(plates) = &self.plates {
            plates
                .lock()
                .map_err(|_| anyhow!("plate pipeline poisoned"))?
                .stop()?;
        }
        if let Some(lights) = &self.traffic_lights {
            lights
                .lock()
                .map_err(|_| anyhow!("traffic light pipeline poisoned"))?
                .stop()?;
        }
        Ok(())
    }
}

impl InboundHandler for ServiceContext {
    fn handle(&self, event_name: &str, payload: &[u8]) {
        let event = match InboundEvent::parse(event_name, payload) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("ignoring malformed {} event: {:#}", event_name, err);
                return;
            }
        };
        let camera_id = event.camera_id().to_string();
        if let Err(err) = self.dispatch(event) {
            log::warn!("[camera {}] {} event skipped: {:#}", camera_id, event_name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Detection, StubBackend, StubScript};
    use crate::events::{OutboundEvent, RecordingSink};
    use base64::Engine;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::time::Instant;

    fn png_base64() -> String {
        let mut out = Vec::new();
        RgbImage::new(64, 48)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(out)
    }

    fn wait_for(sink: &RecordingSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn image_event_reaches_camera_pipeline() {
        let script = StubScript::new();
        script.push(vec![Detection::new("car", 0.9, BBox::new(0.1, 0.1, 0.3, 0.3))]);
        let mut detectors = BackendRegistry::new();
        detectors.register(StubBackend::with_script(script));
        let sink = Arc::new(RecordingSink::new());
        let mut config = PipelineConfig::default();
        config.plates.enabled = false;
        let service =
            ServiceContext::new(config, detectors, sink.clone(), ShutdownFlag::new()).unwrap();

        let payload = format!(r#"{{"cameraId":"cam-1","imageId":"a","buffer":"{}"}}"#, png_base64());
        service.handle("image", payload.as_bytes());
        wait_for(&sink, 1);
        assert_eq!(service.manager().camera_ids(), vec!["cam-1".to_string()]);
        service.shutdown().unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], OutboundEvent::CarDetected(_)));
        assert!(service.manager().is_empty());
    }

    #[test]
    fn rate_limited_traffic_lights_do_not_hold_back_counting() {
        let script = StubScript::new();
        let mut detectors = BackendRegistry::new();
        detectors.register(StubBackend::with_script(script.clone()));
        let sink = Arc::new(RecordingSink::new());
        let mut config = PipelineConfig::default();
        config.plates.enabled = false;
        config.traffic_lights.enabled = true;
        config.traffic_lights.max_per_sec = 1;
        let service =
            ServiceContext::new(config, detectors, sink.clone(), ShutdownFlag::new()).unwrap();
        assert!(service.traffic_lights_enabled());

        let payload = format!(r#"{{"cameraId":"cam-1","buffer":"{}"}}"#, png_base64());
        for _ in 0..3 {
            service.handle("image", payload.as_bytes());
        }
        // one traffic-light frame admitted, three camera frames detected
        let deadline = Instant::now() + Duration::from_secs(5);
        while script.sessions().len() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        service.shutdown().unwrap();
        let sessions = script.sessions();
        assert_eq!(sessions.iter().filter(|s| s.is_some()).count(), 3);
        assert_eq!(sessions.iter().filter(|s| s.is_none()).count(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let sink = Arc::new(RecordingSink::new());
        let mut config = PipelineConfig::default();
        config.plates.enabled = false;
        let service = ServiceContext::new(
            config,
            BackendRegistry::new(),
            sink.clone(),
            ShutdownFlag::new(),
        )
        .unwrap();
        service.handle("image", b"not json");
        service.handle("image", br#"{"cameraId":"","buffer":""}"#);
        service.handle("unknown", b"{}");
        assert!(service.manager().is_empty());
        service.shutdown().unwrap();
        assert!(sink.is_empty());
    }
}
