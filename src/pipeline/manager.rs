//! Routes frames to per-camera pipelines, creating them on first sight and
//! evicting them when idle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::CameraSettings;
use crate::detect::BackendRegistry;
use crate::events::EventSink;
use crate::frame::FrameJob;
use crate::pipeline::camera::CameraPipeline;
use crate::pipeline::queue::PushOutcome;
use crate::pipeline::WorkerState;
use crate::ShutdownFlag;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Enqueued,
    /// The camera queue was full and the frame was discarded.
    Dropped,
    /// Shutdown is in progress; no pipeline accepts frames.
    ShuttingDown,
}

/// Owns every camera pipeline, creating them on first use.
pub struct PipelineManager {
    settings: CameraSettings,
    detectors: BackendRegistry,
    sink: Arc<dyn EventSink>,
    shutdown: ShutdownFlag,
    pipelines: Mutex<HashMap<String, CameraPipeline>>,
}

impl PipelineManager {
    pub fn new(
        settings: CameraSettings,
        detectors: BackendRegistry,
        sink: Arc<dyn EventSink>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            settings,
            detectors,
            sink,
            shutdown,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CameraPipeline>>> {
        self.pipelines
            .lock()
            .map_err(|_| anyhow!("pipeline table lock poisoned"))
    }

    /// Hand a frame to its camera's pipeline, starting the pipeline if needed.
    /// Never blocks on a full queue.
    pub fn route(&self, job: FrameJob) -> Result<RouteOutcome> {
        if self.shutdown.is_set() {
            return Ok(RouteOutcome::ShuttingDown);
        }
        let mut pipelines = self.lock()?;

        let stale = pipelines
            .get(&job.camera_id)
            .map(|p| p.state() == WorkerState::Stopped)
            .unwrap_or(false);
        if stale {
            log::warn!("[camera {}] worker had stopped, restarting", job.camera_id);
            if let Some(mut old) = pipelines.remove(&job.camera_id) {
                if let Err(err) = old.stop() {
                    log::error!("{}", err);
                }
            }
        }

        let camera_id = job.camera_id.clone();
        let pipeline = pipelines.entry(camera_id.clone()).or_insert_with(|| {
            CameraPipeline::spawn(
                camera_id.clone(),
                self.settings.clone(),
                self.detectors.clone(),
                Arc::clone(&self.sink),
                self.shutdown.clone(),
            )
        });

        Ok(match pipeline.push(job) {
            PushOutcome::Enqueued => RouteOutcome::Enqueued,
            PushOutcome::Dropped => {
                log::debug!("[camera {}] queue full, frame dropped", camera_id);
                RouteOutcome::Dropped
            }
            PushOutcome::Closed => {
                log::debug!("[camera {}] worker gone, frame dropped", camera_id);
                RouteOutcome::Dropped
            }
        })
    }

    /// Stop and join one camera's pipeline. Returns false if it did not exist.
    pub fn close(&self, camera_id: &str) -> Result<bool> {
        let removed = self.lock()?.remove(camera_id);
        match removed {
            Some(mut pipeline) => {
                pipeline.stop()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every pipeline that has not been routed a frame within `max_idle`.
    /// A zero duration disables eviction.
    pub fn evict_idle(&self, max_idle: Duration) -> Result<Vec<String>> {
        if max_idle.is_zero() {
            return Ok(Vec::new());
        }
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut pipelines = self.lock()?;
            let idle: Vec<String> = pipelines
                .iter()
                .filter(|(_, p)| p.idle_for(now) >= max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            for id in idle {
                if let Some(pipeline) = pipelines.remove(&id) {
                    pipeline.signal_stop();
                    evicted.push(pipeline);
                }
            }
        }
        let mut ids = Vec::with_capacity(evicted.len());
        for mut pipeline in evicted {
            log::info!(
                "[camera {}] idle for {:?}, closing",
                pipeline.camera_id(),
                max_idle
            );
            pipeline.stop()?;
            ids.push(pipeline.camera_id().to_string());
        }
        ids.sort();
        Ok(ids)
    }

    /// Raise the process-wide shutdown flag and join every worker.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.trigger();
        let drained: Vec<CameraPipeline> = self.lock()?.drain().map(|(_, p)| p).collect();
        let mut first_err = None;
        for mut pipeline in drained {
            if let Err(err) = pipeline.stop() {
                log::error!("{}", err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn queue_len(&self, camera_id: &str) -> Option<usize> {
        self.lock().ok()?.get(camera_id).map(|p| p.queue_len())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
