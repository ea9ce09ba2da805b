//! Progress reporting from inside a running job.
//!
//! Handlers see only the synchronous [`ProgressSink`]. The [`ProgressEmitter`]
//! behind it turns each tick into a [`ProgressEvent`] and publishes it on the
//! job's progress topic. Emission is best-effort: a slow or unreachable bus
//! costs at most one publish timeout per tick and never reaches the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datasource_bus::{BusError, EventPublisher, Message};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::protocol::ProgressEvent;

/// Default upper bound on a single progress publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Where handlers report progress: `(name, total, processed, estimated_time)`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, name: &str, total: u64, processed: u64, estimated_time: f64);
}

/// Sink that discards every tick. Handlers start out with this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _name: &str, _total: u64, _processed: u64, _estimated_time: f64) {}
}

/// Publishes progress events for one job onto one topic.
pub struct ProgressEmitter {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
    pid: u32,
    publish_timeout: Duration,
    runtime: Handle,
    warned: AtomicBool,
}

impl ProgressEmitter {
    /// `runtime` drives publishes issued through the synchronous [`ProgressSink`] API.
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>, runtime: Handle) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            pid: std::process::id(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            runtime,
            warned: AtomicBool::new(false),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Build and publish one event. Failures are logged and dropped.
    pub async fn emit(&self, name: &str, total: u64, processed: u64, estimated_time: f64) {
        let event = ProgressEvent::new(self.pid, name, total, processed, estimated_time);

        let message = match Message::new(self.topic.as_str(), &event) {
            Ok(message) => message,
            Err(e) => {
                self.note_failure(&BusError::Json(e));
                return;
            }
        };

        match tokio::time::timeout(self.publish_timeout, self.publisher.publish(message)).await {
            Ok(Ok(())) => {
                debug!(
                    topic = %self.topic,
                    name = %event.name,
                    processed = event.processed,
                    total = event.total,
                    progress = event.progress_percent,
                    "progress sent"
                );
            }
            Ok(Err(e)) => self.note_failure(&e),
            Err(_) => self.note_failure(&BusError::Timeout(self.publish_timeout)),
        }
    }

    /// First failure per emitter is a warning, the rest are debug noise.
    fn note_failure(&self, error: &BusError) {
        if self.warned.swap(true, Ordering::Relaxed) {
            debug!(topic = %self.topic, error = %error, "progress event dropped");
        } else {
            warn!(topic = %self.topic, error = %error, "progress event dropped, further drops logged at debug");
        }
    }
}

/// Blocks the calling thread for at most the publish timeout.
///
/// Must be called from a blocking thread (e.g. inside `spawn_blocking`),
/// never from an async task on the runtime itself.
impl ProgressSink for ProgressEmitter {
    fn report(&self, name: &str, total: u64, processed: u64, estimated_time: f64) {
        self.runtime.block_on(self.emit(name, total, processed, estimated_time));
    }
}

/// Publisher for a job whose bus could not be reached; every publish fails.
pub struct OfflinePublisher {
    endpoint: String,
    reason: String,
}

impl OfflinePublisher {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for OfflinePublisher {
    async fn publish(&self, _message: Message) -> Result<(), BusError> {
        Err(BusError::Unavailable {
            endpoint: self.endpoint.clone(),
            reason: self.reason.clone(),
        })
    }
}
