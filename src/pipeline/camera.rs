//! One camera's worker: decode, detect, track and count, then emit
//! `car_detected`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::CameraSettings;
use crate::counting::CountingLine;
use crate::detect::{BackendRegistry, DetectMode, Detection, DetectionCapability};
use crate::events::{
    CarDetected, DetectionPayload, EventSink, ImageDimensions, OutboundEvent, VehicleCount,
};
use crate::frame::FrameJob;
use crate::pipeline::queue::{bounded, PushOutcome, QueueSender};
use crate::pipeline::{Worker, WorkerState};
use crate::tracking::{Counters, TrackId, TrackRegistry};
use crate::ShutdownFlag;

/// Per-camera processing state, owned by the camera's worker thread.
pub struct FrameProcessor {
    camera_id: String,
    settings: CameraSettings,
    detectors: BackendRegistry,
    tracks: Option<TrackRegistry>,
}

impl FrameProcessor {
    pub fn new(camera_id: impl Into<String>, settings: CameraSettings, detectors: BackendRegistry) -> Self {
        Self {
            camera_id: camera_id.into(),
            settings,
            detectors,
            tracks: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Counting line, once the first frame has been seen.
    pub fn line(&self) -> Option<&CountingLine> {
        self.tracks.as_ref().map(|t| t.line())
    }

    pub fn counters(&self) -> Option<&Counters> {
        self.tracks.as_ref().map(|t| t.counters())
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.as_ref().map(|t| t.len()).unwrap_or(0)
    }

    /// Run one frame through detection, tracking and counting.
    ///
    /// Returns the `car_detected` payload when at least one vehicle passed the
    /// filters; track state is updated either way.
    pub fn process(&mut self, job: &FrameJob) -> Result<Option<CarDetected>> {
        let image = job.decode()?;
        let (width, height) = image.dimensions();

        let settings = &self.settings;
        let tracks = self.tracks.get_or_insert_with(|| {
            let line = CountingLine::from_frame(width, height, settings.line_position);
            log::info!("[camera {}] counting line initialized at y={}", job.camera_id, line.y);
            TrackRegistry::new(line, settings.limits, settings.labels.iter().map(String::as_str))
        });

        let mode = if settings.tracking {
            DetectMode::Track {
                session: &self.camera_id,
            }
        } else {
            DetectMode::Single
        };
        let started = Instant::now();
        let raw = self
            .detectors
            .detect_with_capability(DetectionCapability::Vehicle, &image, mode)?;
        let inference_time = started.elapsed().as_secs_f64() * 1000.0;

        let detections: Vec<Detection> = raw
            .into_iter()
            .filter(|d| accepts(&self.settings, d))
            .collect();

        let mut current: BTreeMap<String, u64> = self
            .settings
            .labels
            .iter()
            .map(|l| (l.clone(), 0))
            .collect();
        // last observation of a track id within one frame wins
        let mut observed: Vec<(TrackId, (f32, f32), &str)> = Vec::new();
        let mut index: HashMap<TrackId, usize> = HashMap::new();
        for detection in &detections {
            *current.entry(detection.label.clone()).or_insert(0) += 1;
            let Some(id) = detection.track_id else {
                continue;
            };
            let center = detection.bbox.to_pixels(width, height).center();
            match index.get(&id) {
                Some(&i) => observed[i] = (id, center, detection.label.as_str()),
                None => {
                    index.insert(id, observed.len());
                    observed.push((id, center, detection.label.as_str()));
                }
            }
        }

        let timestamp = job.timestamp_secs();
        let mut new_crossings = Vec::new();
        for (id, center, label) in observed {
            if let Some(crossing) = tracks.update(id, center, timestamp, label) {
                let counters = tracks.counters();
                log::info!(
                    "[camera {}] vehicle {} ({}) crossed {}. up: {}, down: {}",
                    self.camera_id,
                    id,
                    label,
                    crossing.direction,
                    counters.total_up,
                    counters.total_down
                );
                new_crossings.push(crossing);
            }
        }
        tracks.prune();

        log::debug!(
            "[camera {}] processed image, found {} vehicles, inference time: {:.2}ms",
            self.camera_id,
            detections.len(),
            inference_time
        );
        if detections.is_empty() {
            return Ok(None);
        }

        Ok(Some(CarDetected {
            camera_id: job.camera_id.clone(),
            image_id: job.image_id.clone(),
            track_line_y: job.track_line_y.clone(),
            detections: detections.iter().map(DetectionPayload::from).collect(),
            inference_time,
            image_dimensions: ImageDimensions { width, height },
            created_at: job.created_at,
            vehicle_count: VehicleCount {
                counters: tracks.counters().clone(),
                current,
            },
            tracks: tracks.snapshot_tracks(),
            new_crossings,
        }))
    }
}

fn accepts(settings: &CameraSettings, detection: &Detection) -> bool {
    detection.confidence >= settings.confidence
        && settings.labels.iter().any(|l| *l == detection.label)
}

/// A camera's queue plus the worker thread consuming it.
pub struct CameraPipeline {
    camera_id: String,
    sender: QueueSender<FrameJob>,
    worker: Worker,
    last_routed: Instant,
}

impl CameraPipeline {
    /// Create the queue and start the worker immediately.
    pub fn spawn(
        camera_id: impl Into<String>,
        settings: CameraSettings,
        detectors: BackendRegistry,
        sink: Arc<dyn EventSink>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let camera_id = camera_id.into();
        let (sender, receiver) = bounded::<FrameJob>(settings.queue_capacity);
        let poll = settings.poll_interval;
        let mut processor = FrameProcessor::new(camera_id.clone(), settings, detectors);
        let worker = Worker::spawn(
            format!("camera {}", camera_id),
            receiver,
            poll,
            shutdown,
            move |job: FrameJob| match processor.process(&job) {
                Ok(Some(payload)) => sink.emit(OutboundEvent::CarDetected(payload)),
                Ok(None) => {}
                Err(err) => log::warn!("[camera {}] frame skipped: {:#}", processor.camera_id(), err),
            },
        );
        log::info!("[camera {}] pipeline started", camera_id);
        Self {
            camera_id,
            sender,
            worker,
            last_routed: Instant::now(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Non-blocking enqueue; a full queue drops the new frame.
    pub fn push(&mut self, job: FrameJob) -> PushOutcome {
        self.last_routed = Instant::now();
        self.sender.push(job)
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_routed)
    }

    pub fn signal_stop(&self) {
        self.worker.signal_stop();
    }

    pub fn stop(&mut self) -> Result<()> {
        self.worker.stop()?;
        log::info!("[camera {}] pipeline stopped", self.camera_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, StubBackend, StubScript};
    use crate::events::RecordingSink;
    use image::{ImageFormat, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn job(encoded: &[u8], t_ms: f64) -> FrameJob {
        FrameJob {
            camera_id: "cam".into(),
            image_id: Some("img".into()),
            created_at: Some(t_ms),
            track_line_y: Value::from(0.5),
            encoded: encoded.to_vec(),
            received_at: t_ms / 1000.0,
        }
    }

    fn processor() -> (FrameProcessor, StubScript) {
        let script = StubScript::new();
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::with_script(script.clone()));
        (FrameProcessor::new("cam", CameraSettings::default(), registry), script)
    }

    fn car_at(id: i64, center_y: f32) -> Detection {
        // 100x100 frame, 10px tall box centred on center_y
        Detection::new(
            "car",
            0.9,
            BBox::from_pixels(40.0, center_y - 5.0, 60.0, center_y + 5.0, 100, 100),
        )
        .with_track_id(id)
    }

    #[test]
    fn crossing_reported_once_across_frames() {
        let (mut proc, script) = processor();
        let frame = png(100, 100);
        for y in [40.0, 48.0, 52.0, 60.0] {
            script.push(vec![car_at(1, y)]);
        }
        let mut crossings = Vec::new();
        for i in 0..4 {
            let payload = proc.process(&job(&frame, 1000.0 + i as f64 * 100.0)).unwrap().unwrap();
            crossings.extend(payload.new_crossings);
        }
        assert_eq!(crossings.len(), 1);
        assert_eq!(proc.line().unwrap().y, 50.0);
        assert_eq!(proc.counters().unwrap().total_down, 1);
    }

    #[test]
    fn far_future_created_at_does_not_stall_counting() {
        let (mut proc, script) = processor();
        let frame = png(100, 100);
        script.push(vec![car_at(9, 20.0)]);
        let first = FrameJob {
            created_at: Some(4.0e12),
            received_at: 1_000.0,
            ..job(&frame, 0.0)
        };
        let payload = proc.process(&first).unwrap().unwrap();
        assert_eq!(payload.created_at, Some(4.0e12));

        for y in [40.0, 48.0, 52.0, 60.0] {
            script.push(vec![car_at(1, y)]);
        }
        let mut crossings = Vec::new();
        for i in 1..=4 {
            let next = FrameJob {
                created_at: Some(1.7e12),
                received_at: 1_000.0 + i as f64 * 0.1,
                ..job(&frame, 0.0)
            };
            crossings.extend(proc.process(&next).unwrap().unwrap().new_crossings);
        }
        assert_eq!(crossings.len(), 1);
        assert_eq!(proc.counters().unwrap().total_down, 1);
    }

    #[test]
    fn filtered_detections_produce_no_payload() {
        let (mut proc, script) = processor();
        let frame = png(100, 100);
        script.push(vec![
            Detection::new("person", 0.99, BBox::new(0.1, 0.1, 0.2, 0.2)).with_track_id(1),
            Detection::new("car", 0.2, BBox::new(0.1, 0.1, 0.2, 0.2)).with_track_id(2),
        ]);
        assert!(proc.process(&job(&frame, 1000.0)).unwrap().is_none());
        assert_eq!(proc.live_tracks(), 0);
        assert!(proc.line().is_some());
    }

    #[test]
    fn untracked_detections_are_reported_but_not_tracked() {
        let (mut proc, script) = processor();
        let frame = png(100, 100);
        script.push(vec![Detection::new("bus", 0.8, BBox::new(0.1, 0.1, 0.3, 0.3))]);
        let payload = proc.process(&job(&frame, 1000.0)).unwrap().unwrap();
        assert_eq!(payload.detections.len(), 1);
        assert_eq!(payload.vehicle_count.current["bus"], 1);
        assert_eq!(payload.vehicle_count.current["car"], 0);
        assert!(payload.tracks.is_empty());
        assert_eq!(payload.image_dimensions, ImageDimensions { width: 100, height: 100 });
    }

    #[test]
    fn undecodable_frame_is_an_error() {
        let (mut proc, _script) = processor();
        assert!(proc.process(&job(b"junk", 0.0)).is_err());
        assert!(proc.line().is_none());
    }

    #[test]
    fn tracking_mode_uses_camera_session() {
        let (mut proc, script) = processor();
        proc.process(&job(&png(10, 10), 0.0)).unwrap();
        assert_eq!(script.sessions(), vec![Some("cam".to_string())]);
    }

    #[test]
    fn bad_frame_does_not_stop_the_worker() {
        let script = StubScript::new();
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::with_script(script.clone()));
        let sink = Arc::new(RecordingSink::new());
        let settings = CameraSettings {
            poll_interval: Duration::from_millis(10),
            ..CameraSettings::default()
        };
        let mut pipeline =
            CameraPipeline::spawn("cam", settings, registry, sink.clone(), ShutdownFlag::new());

        script.push(vec![car_at(1, 30.0)]);
        assert_eq!(pipeline.push(job(b"junk", 1000.0)), PushOutcome::Enqueued);
        assert_eq!(pipeline.push(job(&png(100, 100), 1100.0)), PushOutcome::Enqueued);

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pipeline.state(), WorkerState::Running);
        pipeline.stop().unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], OutboundEvent::CarDetected(_)));
    }
}
