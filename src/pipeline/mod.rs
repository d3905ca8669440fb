//! Per-camera pipelines and the worker threads that drive every queue.

pub mod camera;
pub mod manager;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::RecvTimeoutError;

use crate::ShutdownFlag;

pub use camera::{CameraPipeline, FrameProcessor};
pub use manager::{PipelineManager, RouteOutcome};
pub use queue::{bounded, Admission, PushOutcome, QueueReceiver, QueueSender, RateLimiter};

/// Lifecycle of a worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

/// Handle to a single-consumer worker thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a thread that feeds every item from `rx` to `handle`.
    ///
    /// The loop wakes at least every `poll` to observe both the process-wide
    /// shutdown flag and this worker's own stop flag. Items still queued when
    /// either is raised are abandoned.
    pub fn spawn<T, F>(
        name: impl Into<String>,
        rx: QueueReceiver<T>,
        poll: Duration,
        shutdown: ShutdownFlag,
        mut handle: F,
    ) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(WorkerState::Idle));

        let stop_thread = stop.clone();
        let state_thread = state.clone();
        let thread_name = name.clone();
        let join = std::thread::spawn(move || {
            if let Ok(mut state) = state_thread.lock() {
                if *state == WorkerState::Idle {
                    *state = WorkerState::Running;
                }
            }
            log::debug!("{} worker started", thread_name);
            loop {
                if shutdown.is_set() || stop_thread.load(Ordering::SeqCst) {
                    break;
                }
                match rx.recv_timeout(poll) {
                    Ok(item) => handle(item),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            if let Ok(mut state) = state_thread.lock() {
                *state = WorkerState::Stopped;
            }
            log::debug!("{} worker stopped", thread_name);
        });

        Self {
            name,
            stop,
            state,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(WorkerState::Stopped)
    }

    /// Ask the worker to exit without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and join. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        self.signal_stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} worker thread panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
