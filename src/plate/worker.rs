//! Rate-limited plate worker fed by `violation_detect` events.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::config::PlateSettings;
use crate::detect::BackendRegistry;
use crate::events::{EventSink, OutboundEvent, VehicleRegion, ViolationDetectEvent, ViolationLicensePlate};
use crate::frame;
use crate::pipeline::queue::{bounded, Admission, QueueSender, RateLimiter};
use crate::pipeline::{Worker, WorkerState};
use crate::plate::{CandidateFilter, PlateReader, PlateValidator};
use crate::ShutdownFlag;

/// A violation waiting for plate recognition.
#[derive(Clone, Debug)]
pub struct PlateJob {
    pub camera_id: String,
    pub image_id: Option<String>,
    pub violations: Value,
    pub encoded: Vec<u8>,
    pub regions: Vec<VehicleRegion>,
}

impl PlateJob {
    pub fn from_event(event: ViolationDetectEvent) -> Result<Self> {
        let encoded = event.buffer.into_bytes()?;
        if encoded.is_empty() {
            return Err(anyhow!("empty image buffer"));
        }
        Ok(Self {
            camera_id: event.camera_id,
            image_id: event.image_id,
            violations: event.violations,
            encoded,
            regions: event.detections,
        })
    }
}

pub struct PlateProcessor {
    settings: PlateSettings,
    reader: PlateReader,
    validator: PlateValidator,
}

impl PlateProcessor {
    pub fn new(settings: PlateSettings, detectors: BackendRegistry) -> Result<Self> {
        let validator = PlateValidator::new(&settings.pattern)?;
        let reader = PlateReader::new(
            detectors,
            CandidateFilter {
                min_confidence: settings.confidence,
                min_width: settings.min_width,
                min_height: settings.min_height,
            },
        );
        Ok(Self {
            settings,
            reader,
            validator,
        })
    }

    /// Recognize validated plates for one violation. `None` when the image is
    /// too small to be worth reading.
    pub fn process(&self, job: &PlateJob) -> Result<Option<ViolationLicensePlate>> {
        let image = frame::decode(&job.encoded)?;
        let (width, height) = image.dimensions();
        if width < self.settings.min_image_side || height < self.settings.min_image_side {
            log::warn!(
                "[camera {}] image {}x{} too small for plate recognition",
                job.camera_id,
                width,
                height
            );
            return Ok(None);
        }
        let image = frame::fit_within(image, self.settings.max_side);

        let started = Instant::now();
        let read = self.reader.recognize(&image, &job.regions)?;
        let inference_time = started.elapsed().as_secs_f64() * 1000.0;
        let license_plates = self.validator.retain_valid(read);

        log::info!(
            "[camera {}] image {}: plates {:?}, inference time: {:.2}ms",
            job.camera_id,
            job.image_id.as_deref().unwrap_or("-"),
            license_plates,
            inference_time
        );
        Ok(Some(ViolationLicensePlate {
            camera_id: job.camera_id.clone(),
            image_id: job.image_id.clone(),
            inference_time,
            license_plates,
            violations: job.violations.clone(),
        }))
    }
}

/// Single-consumer plate recognition queue shared by every camera.
pub struct PlatePipeline {
    sender: QueueSender<PlateJob>,
    worker: Worker,
    limiter: Mutex<RateLimiter>,
}

impl PlatePipeline {
    pub fn spawn(
        settings: PlateSettings,
        detectors: BackendRegistry,
        sink: Arc<dyn EventSink>,
        shutdown: ShutdownFlag,
    ) -> Result<Self> {
        let (sender, receiver) = bounded::<PlateJob>(settings.queue_capacity);
        let limiter = Mutex::new(RateLimiter::per_second(settings.max_per_sec));
        let poll = settings.poll_interval;
        let processor = PlateProcessor::new(settings, detectors)?;
        let worker = Worker::spawn("plate", receiver, poll, shutdown, move |job: PlateJob| {
            match processor.process(&job) {
                Ok(Some(payload)) => sink.emit(OutboundEvent::ViolationLicensePlate(payload)),
                Ok(None) => {}
                Err(err) => log::warn!("[camera {}] plate job skipped: {:#}", job.camera_id, err),
            }
        });
        Ok(Self {
            sender,
            worker,
            limiter,
        })
    }

    /// Rate-limit, then enqueue without blocking.
    pub fn submit(&self, event: ViolationDetectEvent) -> Result<Admission> {
        let allowed = self
            .limiter
            .lock()
            .map_err(|_| anyhow!("plate rate limiter poisoned"))?
            .allow(Instant::now());
        if !allowed {
            log::debug!("[camera {}] violation_detect rate limited", event.camera_id);
            return Ok(Admission::RateLimited);
        }
        let job = PlateJob::from_event(event)?;
        let camera_id = job.camera_id.clone();
        let admission = Admission::from(self.sender.push(job));
        if admission == Admission::Dropped {
            log::debug!("[camera {}] plate queue full, violation dropped", camera_id);
        }
        Ok(admission)
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.worker.stop()
    }
}
