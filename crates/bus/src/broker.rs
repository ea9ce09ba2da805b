use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use zeromq::prelude::*;
use zeromq::{PubSocket, RepSocket, SubSocket, ZmqMessage};

use crate::error::BusError;
use crate::transport::Transport;

/// Per-topic counters stop growing past this many distinct topics.
///
/// Response and progress topics are unique per request, so a long-running
/// broker would otherwise accumulate one entry per command forever.
const MAX_TRACKED_TOPICS: usize = 1024;

/// Bucket for topics seen after the table is full.
const OVERFLOW_TOPIC: &str = "<other>";

/// Metrics collected by the broker during message proxying.
#[derive(Debug)]
pub struct BrokerMetrics {
    /// Total messages forwarded through the proxy.
    pub total_messages: AtomicU64,
    /// Total payload bytes forwarded (all frames).
    pub total_bytes: AtomicU64,
    /// Per-topic message counts, capped at [`MAX_TRACKED_TOPICS`].
    pub topic_counts: Mutex<HashMap<String, u64>>,
}

impl BrokerMetrics {
    fn new() -> Self {
        Self {
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            topic_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of total forwarded messages.
    pub fn total(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    async fn record(&self, topic: &str, bytes: u64) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);

        let mut counts = self.topic_counts.lock().await;
        let key = if counts.contains_key(topic) || counts.len() < MAX_TRACKED_TOPICS {
            topic
        } else {
            OVERFLOW_TOPIC
        };
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Socket configuration for the event broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Frontend endpoint where publishers connect (broker binds SUB here).
    pub frontend: Transport,
    /// Backend endpoint where subscribers connect (broker binds PUB here).
    pub backend: Transport,
    /// Health check endpoint (REP socket for liveness probes).
    pub health: Transport,
}

impl BrokerConfig {
    /// Create a local IPC broker configuration.
    pub fn local() -> Self {
        Self {
            frontend: Transport::ipc("broker-frontend"),
            backend: Transport::ipc("broker-backend"),
            health: Transport::ipc("broker-health"),
        }
    }

    /// Create a TCP broker configuration.
    pub fn tcp(host: &str, frontend_port: u16, backend_port: u16, health_port: u16) -> Self {
        Self {
            frontend: Transport::tcp(host, frontend_port),
            backend: Transport::tcp(host, backend_port),
            health: Transport::tcp(host, health_port),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::tcp("127.0.0.1", 5555, 5556, 5557)
    }
}

/// PUB/SUB forwarding broker: the shared bus every component talks through.
///
/// - Publishers connect to the **frontend** (SUB socket that the broker binds).
/// - Subscribers connect to the **backend** (PUB socket that the broker binds).
/// - Messages received on the frontend are forwarded unchanged to the backend.
///
/// `zeromq` 0.4 has no XPUB/XSUB, so the frontend subscribes to everything
/// and subscription filtering happens only at the backend.
pub struct EventBroker {
    config: BrokerConfig,
    metrics: Arc<BrokerMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl EventBroker {
    /// Create a new broker with the given configuration.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(BrokerMetrics::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    /// Signal the broker to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the broker proxy loop.
    ///
    /// Binds the SUB frontend, the PUB backend and the REP health socket,
    /// then forwards until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), BusError> {
        for transport in [&self.config.frontend, &self.config.backend, &self.config.health] {
            transport.ensure_ipc_dir()?;
            transport.remove_stale_socket()?;
        }

        let mut frontend = SubSocket::new();
        frontend.bind(&self.config.frontend.endpoint()).await?;
        frontend.subscribe("").await?;
        tracing::info!(
            endpoint = %self.config.frontend,
            "broker frontend (SUB) bound, publishers connect here"
        );

        let mut backend = PubSocket::new();
        backend.bind(&self.config.backend.endpoint()).await?;
        tracing::info!(
            endpoint = %self.config.backend,
            "broker backend (PUB) bound, subscribers connect here"
        );

        let mut health = RepSocket::new();
        health.bind(&self.config.health.endpoint()).await?;
        tracing::info!(endpoint = %self.config.health, "broker health check (REP) bound");

        let shutdown_flag = self.shutdown.clone();
        let health_handle = tokio::spawn(async move {
            Self::health_loop(&mut health, &shutdown_flag).await;
        });

        let metrics = self.metrics.clone();
        tracing::info!("broker proxy loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("broker shutting down");
                break;
            }

            // Timeout so the shutdown flag is checked periodically.
            let msg = match tokio::time::timeout(Duration::from_millis(100), frontend.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "frontend recv error");
                    continue;
                }
                Err(_) => continue,
            };

            let topic = extract_topic(&msg);
            let byte_size: u64 = msg.iter().map(|f| f.len() as u64).sum();
            metrics.record(&topic, byte_size).await;

            tracing::debug!(topic = %topic, bytes = byte_size, "forwarding message");

            if let Err(e) = backend.send(msg).await {
                tracing::warn!(error = %e, topic = %topic, "backend send error");
            }
        }

        health_handle.abort();
        tracing::info!(total = metrics.total(), "broker stopped");
        Ok(())
    }

    /// Health check responder loop: replies "ok" to any request.
    async fn health_loop(health: &mut RepSocket, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            match tokio::time::timeout(Duration::from_millis(500), health.recv()).await {
                Ok(Ok(_request)) => {
                    let reply: ZmqMessage = "ok".into();
                    if let Err(e) = health.send(reply).await {
                        tracing::warn!(error = %e, "health reply error");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "health recv error");
                }
                Err(_) => {}
            }
        }
    }
}

/// Topic string from the first frame, or `<binary>` when it is not UTF-8.
fn extract_topic(msg: &ZmqMessage) -> String {
    msg.iter()
        .next()
        .map(|frame| String::from_utf8(frame.to_vec()).unwrap_or_else(|_| "<binary>".to_string()))
        .unwrap_or_else(|| "<empty>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_local_endpoints() {
        let cfg = BrokerConfig::local();
        assert!(cfg.frontend.endpoint().contains("broker-frontend"));
        assert!(cfg.backend.endpoint().contains("broker-backend"));
        assert!(cfg.health.endpoint().contains("broker-health"));
    }

    #[test]
    fn broker_config_default_is_loopback_tcp() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.frontend.endpoint(), "tcp://127.0.0.1:5555");
        assert_eq!(cfg.backend.endpoint(), "tcp://127.0.0.1:5556");
        assert_eq!(cfg.health.endpoint(), "tcp://127.0.0.1:5557");
    }

    #[test]
    fn extract_topic_from_utf8_frame() {
        let msg: ZmqMessage = "datasource_progress".into();
        assert_eq!(extract_topic(&msg), "datasource_progress");
    }

    #[tokio::test]
    async fn topic_counts_are_capped() {
        let m = BrokerMetrics::new();
        for i in 0..(MAX_TRACKED_TOPICS + 10) {
            m.record(&format!("response_{i}"), 10).await;
        }
        m.record("response_0", 10).await;

        let counts = m.topic_counts.lock().await;
        assert_eq!(counts.len(), MAX_TRACKED_TOPICS + 1);
        assert_eq!(counts[OVERFLOW_TOPIC], 10);
        assert_eq!(counts["response_0"], 2);
        assert_eq!(m.total(), (MAX_TRACKED_TOPICS + 11) as u64);
    }
}
