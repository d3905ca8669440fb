//! Traffic-light state detection on camera frames.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::config::TrafficLightSettings;
use crate::detect::{BackendRegistry, DetectMode, Detection, DetectionCapability};
use crate::events::{DetectionPayload, EventSink, ImageDimensions, OutboundEvent, TrafficLight};
use crate::frame::{self, FrameJob};
use crate::pipeline::queue::{bounded, Admission, QueueSender, RateLimiter};
use crate::pipeline::{Worker, WorkerState};
use crate::ShutdownFlag;

/// Label of the most confident detection; the first one wins a tie.
pub fn dominant_label(detections: &[Detection]) -> Option<&str> {
    let mut best: Option<&Detection> = None;
    for d in detections {
        if best.map(|b| d.confidence > b.confidence).unwrap_or(true) {
            best = Some(d);
        }
    }
    best.map(|d| d.label.as_str())
}

pub struct TrafficLightProcessor {
    settings: TrafficLightSettings,
    detectors: BackendRegistry,
}

impl TrafficLightProcessor {
    pub fn new(settings: TrafficLightSettings, detectors: BackendRegistry) -> Self {
        Self {
            settings,
            detectors,
        }
    }

    pub fn process(&self, job: &FrameJob) -> Result<Option<TrafficLight>> {
        let image = frame::fit_within(job.decode()?, self.settings.max_side);
        let (width, height) = image.dimensions();

        let started = Instant::now();
        let detections: Vec<Detection> = self
            .detectors
            .detect_with_capability(DetectionCapability::TrafficLight, &image, DetectMode::Single)?
            .into_iter()
            .filter(|d| d.confidence >= self.settings.confidence)
            .collect();
        let inference_time = started.elapsed().as_secs_f64() * 1000.0;

        let Some(status) = dominant_label(&detections) else {
            return Ok(None);
        };
        log::debug!(
            "[camera {}] traffic light {} ({} detections, {:.2}ms)",
            job.camera_id,
            status,
            detections.len(),
            inference_time
        );
        Ok(Some(TrafficLight {
            camera_id: job.camera_id.clone(),
            image_id: job.image_id.clone(),
            traffic_status: status.to_string(),
            detections: detections.iter().map(DetectionPayload::from).collect(),
            inference_time,
            image_dimensions: ImageDimensions { width, height },
            created_at: job.created_at,
        }))
    }
}

/// Single queue of frames for traffic-light detection, shared by all cameras.
pub struct TrafficLightPipeline {
    sender: QueueSender<FrameJob>,
    worker: Worker,
    limiter: Mutex<RateLimiter>,
}

impl TrafficLightPipeline {
    pub fn spawn(
        settings: TrafficLightSettings,
        detectors: BackendRegistry,
        sink: Arc<dyn EventSink>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let (sender, receiver) = bounded::<FrameJob>(settings.queue_capacity);
        let limiter = Mutex::new(RateLimiter::per_second(settings.max_per_sec));
        let poll = settings.poll_interval;
        let processor = TrafficLightProcessor::new(settings, detectors);
        let worker = Worker::spawn("traffic light", receiver, poll, shutdown, move |job: FrameJob| {
            match processor.process(&job) {
                Ok(Some(payload)) => sink.emit(OutboundEvent::TrafficLight(payload)),
                Ok(None) => {}
                Err(err) => log::warn!("[camera {}] traffic light frame skipped: {:#}", job.camera_id, err),
            }
        });
        Self {
            sender,
            worker,
            limiter,
        }
    }

    /// Offer a frame. The frame is copied into the queue only once the rate
    /// limiter admits it.
    pub fn submit(&self, job: &FrameJob) -> Result<Admission> {
        let allowed = self
            .limiter
            .lock()
            .map_err(|_| anyhow!("traffic light rate limiter poisoned"))?
            .allow(Instant::now());
        if !allowed {
            return Ok(Admission::RateLimited);
        }
        Ok(Admission::from(self.sender.push(job.clone())))
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
