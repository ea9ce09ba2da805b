//! datasource-manager: starts data-source jobs on command.
//!
//! Subscribes to `datasource_commands_<host address>` on the bus and runs
//! each `start_data_source` command in its own `datasource-launcher` process,
//! replying on the command's response channel when the job exits.
//!
//! # Usage
//!
//! ```bash
//! # Default config (config/datasource.toml if present), discovered host address
//! datasource-manager
//!
//! # Pin the address used in the command topic
//! datasource-manager --host-address 10.0.0.7
//!
//! # At most four jobs at a time
//! DATASOURCE_MANAGER_MAX_CONCURRENT_JOBS=4 datasource-manager
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use datasource_bus::{shutdown_signal, BusSession, RetryPolicy};
use datasource_manager::topics::command_topic;
use datasource_manager::{net, DatasourceConfig, Dispatcher, DispatcherConfig, ProcessLauncher};
use tokio::sync::Notify;

/// Listens for data-source commands and runs each one as a job process.
#[derive(Parser, Debug)]
#[command(name = "datasource-manager", version, about)]
struct Cli {
    /// Configuration file (default: config/datasource.toml if present).
    #[arg(long, env = "DATASOURCE_CONFIG")]
    config: Option<PathBuf>,

    /// Address used in the command topic instead of the discovered one.
    #[arg(long)]
    host_address: Option<String>,

    /// Path to the datasource-launcher binary.
    #[arg(long)]
    launcher_binary: Option<PathBuf>,

    /// Maximum number of jobs running at once.
    #[arg(long)]
    max_concurrent_jobs: Option<usize>,
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
    let mut config = DatasourceConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.host_address.is_some() {
        config.manager.host_address = cli.host_address;
    }
    if cli.launcher_binary.is_some() {
        config.manager.launcher_binary = cli.launcher_binary;
    }
    if cli.max_concurrent_jobs.is_some() {
        config.manager.max_concurrent_jobs = cli.max_concurrent_jobs;
    }
    config.validate().context("invalid configuration")?;

    let host = config
        .manager
        .host_address
        .clone()
        .unwrap_or_else(|| net::local_ip().to_string());
    let topic = command_topic(&host);

    let launcher_binary = config.manager.resolve_launcher_binary()?;
    if !launcher_binary.exists() {
        tracing::warn!(path = %launcher_binary.display(), "launcher binary not found, jobs will fail to start");
    }
    tracing::info!(%host, %topic, launcher = %launcher_binary.display(), "starting datasource-manager");

    let session = tokio::select! {
        session = BusSession::connect_with_retry(
            &config.bus,
            RetryPolicy::forever(config.manager.bus_retry_interval()),
        ) => session.context("failed to attach to bus")?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown before the bus came up");
            return Ok(());
        }
    };

    let launcher = ProcessLauncher::new(launcher_binary, config.bus.frontend.clone())
        .settle_ms(config.launcher.settle_ms)
        .stderr_tail_lines(config.manager.stderr_tail_lines);

    let dispatcher = Dispatcher::new(
        DispatcherConfig::new(topic)
            .max_concurrent_jobs(config.manager.max_concurrent_jobs)
            .shutdown_timeout(config.manager.shutdown_timeout()),
        session.publisher,
        session.subscriber,
        Arc::new(launcher),
    );

    let shutdown = Arc::new(Notify::new());
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_for_signal.notify_one();
    });

    dispatcher.run(shutdown).await.context("dispatcher failed")?;

    tracing::info!("datasource-manager exited cleanly");
    Ok(())
}
