//! Bounded drop-new queues and inbound rate limiting.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

/// What happened to an item offered to a full-or-not queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Queue was full; the new item was discarded.
    Dropped,
    /// The consumer is gone.
    Closed,
}

/// Producer half. Cloneable; never blocks.
pub struct QueueSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Consumer half, owned by exactly one worker.
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
}

/// Create a queue holding at most `capacity` items. Zero is raised to one.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

impl<T> QueueSender<T> {
    /// Offer an item without blocking. When full the new item is dropped.
    pub fn push(&self, item: T) -> PushOutcome {
        match self.tx.try_send(item) {
            Ok(()) => PushOutcome::Enqueued,
            Err(TrySendError::Full(_)) => PushOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

impl<T> QueueReceiver<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// What happened to an inbound event offered to a rate-limited worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Enqueued,
    /// Queue full or worker gone.
    Dropped,
    /// Arrived faster than the worker's inbound rate.
    RateLimited,
}

impl From<PushOutcome> for Admission {
    fn from(outcome: PushOutcome) -> Self {
        match outcome {
            PushOutcome::Enqueued => Self::Enqueued,
            PushOutcome::Dropped | PushOutcome::Closed => Self::Dropped,
        }
    }
}

/// Admits at most one event per `min_interval`; the rest are rejected.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    /// A limiter for `max_per_sec` events per second. Zero disables limiting.
    pub fn per_second(max_per_sec: u32) -> Self {
        let min_interval = if max_per_sec == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / max_per_sec as f64)
        };
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
