//! The job runner: executes one handler to completion inside a job process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use datasource_bus::EventPublisher;
use tokio::runtime::Handle;
use tracing::{error, info, instrument};

use crate::error::{HandlerError, RunnerError};
use crate::progress::{ProgressEmitter, DEFAULT_PUBLISH_TIMEOUT};
use crate::protocol::HandlerParams;
use crate::registry::HandlerRegistry;

/// Process exit codes of `datasource-launcher`.
pub const EXIT_OK: i32 = 0;
pub const EXIT_HANDLER_FAILED: i32 = 1;
pub const EXIT_UNKNOWN_HANDLER: i32 = 2;
pub const EXIT_INVALID_PARAMS: i32 = 3;

/// Summary of a job that ran to completion.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub handler: String,
    pub progress_topic: String,
    pub elapsed: Duration,
}

impl RunnerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::UnknownHandler(_) => EXIT_UNKNOWN_HANDLER,
            RunnerError::InvalidParams { .. } => EXIT_INVALID_PARAMS,
            RunnerError::Failed { .. } | RunnerError::Panicked(_) => EXIT_HANDLER_FAILED,
        }
    }
}

/// Parse the launcher's `--params` argument, which must be a JSON object.
pub fn parse_params(handler: &str, raw: &str) -> Result<HandlerParams, RunnerError> {
    let invalid = |reason: String| RunnerError::InvalidParams {
        handler: handler.to_string(),
        reason,
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(invalid(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Resolves handlers and runs them with a progress emitter attached.
pub struct JobRunner {
    registry: HandlerRegistry,
    publisher: Arc<dyn EventPublisher>,
    publish_timeout: Duration,
}

impl JobRunner {
    pub fn new(registry: HandlerRegistry, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            registry,
            publisher,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Like [`run`](Self::run) with parameters still encoded as JSON text.
    ///
    /// The handler is resolved before the parameters are parsed, so an
    /// unknown handler is reported as such whatever the parameters hold.
    pub async fn run_json(
        &self,
        handler_id: &str,
        raw_params: &str,
        progress_topic: &str,
    ) -> Result<JobReport, RunnerError> {
        if !self.registry.contains(handler_id) {
            return Err(RunnerError::UnknownHandler(handler_id.to_string()));
        }
        let params = parse_params(handler_id, raw_params)?;
        self.run(handler_id, params, progress_topic).await
    }

    /// Build the handler, attach progress reporting, and run `fetch` on a
    /// blocking thread until it returns.
    #[instrument(skip_all, fields(handler = %handler_id, topic = %progress_topic))]
    pub async fn run(
        &self,
        handler_id: &str,
        params: HandlerParams,
        progress_topic: &str,
    ) -> Result<JobReport, RunnerError> {
        let factory = self
            .registry
            .resolve(handler_id)
            .ok_or_else(|| RunnerError::UnknownHandler(handler_id.to_string()))?;

        let mut handler = factory(params).map_err(|e| match e {
            HandlerError::InvalidParams(reason) => RunnerError::InvalidParams {
                handler: handler_id.to_string(),
                reason,
            },
            source => RunnerError::Failed {
                handler: handler_id.to_string(),
                source,
            },
        })?;

        let emitter = ProgressEmitter::new(self.publisher.clone(), progress_topic, Handle::current())
            .with_publish_timeout(self.publish_timeout);
        handler.set_progress_sink(Arc::new(emitter));

        info!("job starting");
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || handler.fetch()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(())) => {
                info!(?elapsed, "job finished");
                Ok(JobReport {
                    handler: handler_id.to_string(),
                    progress_topic: progress_topic.to_string(),
                    elapsed,
                })
            }
            Ok(Err(source)) => {
                error!(error = %source, ?elapsed, "job failed");
                Err(RunnerError::Failed {
                    handler: handler_id.to_string(),
                    source,
                })
            }
            Err(join) => {
                error!(error = %join, ?elapsed, "job panicked");
                Err(RunnerError::Panicked(handler_id.to_string()))
            }
        }
    }
}
