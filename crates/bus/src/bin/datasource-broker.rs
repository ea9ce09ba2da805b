//! datasource-broker: the shared PUB/SUB bus for managers, launchers and clients.
//!
//! Forwards everything published on the frontend to subscribers on the
//! backend and answers health probes on a REP socket.
//!
//! # Usage
//!
//! ```bash
//! # Loopback defaults (5555 / 5556 / 5557)
//! datasource-broker
//!
//! # Reachable from other hosts
//! datasource-broker --frontend tcp://0.0.0.0:5555 --backend tcp://0.0.0.0:5556 --health tcp://0.0.0.0:5557
//!
//! # Same host only, over IPC sockets
//! datasource-broker --ipc
//!
//! # Via environment variables
//! DATASOURCE_BUS_FRONTEND=tcp://0.0.0.0:6000 datasource-broker
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use datasource_bus::{shutdown_signal, BrokerConfig, BusConfig, EventBroker};

/// Shared PUB/SUB broker for data-source commands, progress and responses.
#[derive(Parser, Debug)]
#[command(name = "datasource-broker", version, about)]
struct Cli {
    /// Endpoint publishers connect to.
    #[arg(long, env = "DATASOURCE_BUS_FRONTEND", default_value = "tcp://127.0.0.1:5555")]
    frontend: String,

    /// Endpoint subscribers connect to.
    #[arg(long, env = "DATASOURCE_BUS_BACKEND", default_value = "tcp://127.0.0.1:5556")]
    backend: String,

    /// Health check endpoint.
    #[arg(long, env = "DATASOURCE_BUS_HEALTH", default_value = "tcp://127.0.0.1:5557")]
    health: String,

    /// Bind IPC sockets under /tmp/datasource-bus instead of the TCP endpoints.
    #[arg(long)]
    ipc: bool,

    /// Interval in seconds between metrics log lines (0 = disabled).
    #[arg(long, env = "DATASOURCE_BROKER_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting datasource-broker");

    let broker_config = if cli.ipc {
        BrokerConfig::local()
    } else {
        let bus = BusConfig {
            frontend: cli.frontend,
            backend: cli.backend,
            health: cli.health,
        };
        bus.validate().context("invalid bus endpoints")?;
        bus.broker_config()?
    };
    let broker = Arc::new(EventBroker::new(broker_config));

    let broker_for_signal = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
    });

    if cli.metrics_interval > 0 {
        let metrics = broker.metrics().clone();
        let every = Duration::from_secs(cli.metrics_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let counts = metrics.topic_counts.lock().await;
                tracing::info!(
                    total_messages = metrics.total(),
                    total_bytes = metrics.total_bytes.load(Ordering::Relaxed),
                    unique_topics = counts.len(),
                    "broker metrics"
                );
                for (topic, count) in counts.iter() {
                    tracing::debug!(topic = %topic, count, "topic stats");
                }
            }
        });
    }

    broker.run().await.context("broker failed")?;

    tracing::info!("datasource-broker exited cleanly");
    Ok(())
}
