//! Attaching to the bus: health probe, socket setup and startup retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{ReqSocket, ZmqMessage};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::pubsub::{ZmqPublisher, ZmqSubscriber};
use crate::transport::Transport;

/// How long a single health probe may take before the bus counts as down.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ask the broker's REP health socket whether it is alive.
///
/// Succeeds only when the broker answers `ok` within `timeout`.
#[instrument(skip_all, fields(endpoint = %transport))]
pub async fn probe_health(transport: &Transport, timeout: Duration) -> Result<(), BusError> {
    let endpoint = transport.endpoint();
    let probe = async {
        let mut socket = ReqSocket::new();
        socket.connect(&endpoint).await?;
        socket.send(ZmqMessage::from("ping")).await?;
        let reply = socket.recv().await?;
        Ok::<_, BusError>(reply)
    };

    let reply = tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| BusError::Timeout(timeout))??;

    match reply.get(0).map(|frame| frame.as_ref()) {
        Some(b"ok") => Ok(()),
        other => Err(BusError::Unavailable {
            endpoint,
            reason: format!(
                "unexpected health reply {:?}",
                other.map(String::from_utf8_lossy)
            ),
        }),
    }
}

/// Fixed-interval retry schedule used when attaching to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Keep trying until the bus answers.
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` failures.
    pub fn attempts(attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: Some(attempts.max(1)),
        }
    }
}

/// A publisher/subscriber pair attached to the same broker.
pub struct BusSession {
    pub publisher: Arc<ZmqPublisher>,
    pub subscriber: Arc<ZmqSubscriber>,
}

impl BusSession {
    /// Probe the broker once, then connect both sockets.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        probe_health(&config.health_transport()?, DEFAULT_PROBE_TIMEOUT).await?;
        let publisher = ZmqPublisher::connect(&config.frontend_transport()?).await?;
        let subscriber = ZmqSubscriber::connect(&config.backend_transport()?).await?;
        Ok(Self {
            publisher: Arc::new(publisher),
            subscriber: Arc::new(subscriber),
        })
    }

    /// [`connect`](Self::connect), retried on `policy` until it succeeds.
    ///
    /// Configuration errors are returned immediately; only connectivity
    /// failures are retried.
    pub async fn connect_with_retry(config: &BusConfig, policy: RetryPolicy) -> Result<Self, BusError> {
        config.validate()?;
        retry(policy, "bus", || Self::connect(config)).await
    }
}

/// Run `attempt` until it succeeds or `policy` is exhausted.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut attempt: F) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BusError>>,
{
    let mut tries: u32 = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => {
                if tries > 1 {
                    info!(what, attempts = tries, "attached after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| tries >= max) {
                    warn!(what, attempts = tries, error = %e, "giving up");
                    return Err(e);
                }
                warn!(
                    what,
                    attempt = tries,
                    retry_in = ?policy.interval,
                    error = %e,
                    "unavailable, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
