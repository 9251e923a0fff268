//! In-process pub/sub of job events.
//!
//! Delivery is at-most-once: each subscriber owns a bounded FIFO queue and a
//! full queue silently drops the new event. Publishers never block and never
//! see an error; full state is always recoverable by polling the store.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use facefusion_protocol::JobEvent;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

struct Subscriber {
    /// `None` subscribes to every job.
    job_id: Option<String>,
    tx: mpsc::Sender<JobEvent>,
}

/// Event bus for publishing and subscribing to job events.
///
/// Cheap to clone; all clones share the subscriber table. Publication is safe
/// from any thread, including the blocking worker pool.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to every matching subscriber. Disconnected
    /// subscribers are pruned; full queues drop the event for that
    /// subscriber only.
    pub fn publish(&self, event: &JobEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        subscribers.retain(|subscriber| {
            let matches = subscriber
                .job_id
                .as_deref()
                .map_or(true, |id| id == event.job_id);
            if !matches {
                return true;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Subscribe to events for one job. The stream ends after the first
    /// terminal event for that job.
    pub fn subscribe_job(&self, job_id: &str) -> EventStream {
        self.subscribe_inner(Some(job_id.to_string()), DEFAULT_QUEUE_DEPTH)
    }

    /// Subscribe to every event. The stream lasts until dropped.
    pub fn subscribe_all(&self) -> EventStream {
        self.subscribe_inner(None, DEFAULT_QUEUE_DEPTH)
    }

    /// Subscribe with an explicit queue depth.
    pub fn subscribe_with_depth(&self, job_id: Option<&str>, depth: usize) -> EventStream {
        self.subscribe_inner(job_id.map(str::to_string), depth)
    }

    fn subscribe_inner(&self, job_id: Option<String>, depth: usize) -> EventStream {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Subscriber {
            job_id: job_id.clone(),
            tx,
        });
        EventStream {
            rx,
            job_id,
            done: false,
        }
    }

    /// Number of live subscribers (test and status use).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A subscriber's view of the bus: per-subscriber FIFO, bounded.
pub struct EventStream {
    rx: mpsc::Receiver<JobEvent>,
    job_id: Option<String>,
    done: bool,
}

impl EventStream {
    /// Next event, or `None` once the stream is finished. Per-job streams
    /// finish after delivering the terminal event for their job.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await?;
        if let Some(job_id) = &self.job_id {
            if event.is_terminal() && event.job_id == *job_id {
                self.done = true;
                self.rx.close();
            }
        }
        Some(event)
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_next(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.try_recv().ok()?;
        if let Some(job_id) = &self.job_id {
            if event.is_terminal() && event.job_id == *job_id {
                self.done = true;
                self.rx.close();
            }
        }
        Some(event)
    }
}
