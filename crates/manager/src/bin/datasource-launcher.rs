//! datasource-launcher: runs one data-source handler as a job process.
//!
//! Started by `datasource-manager` once per command. Progress is published on
//! the bus; the outcome is reported through the exit code:
//!
//! | code | meaning                               |
//! |------|---------------------------------------|
//! | 0    | handler finished                      |
//! | 1    | handler failed or panicked            |
//! | 2    | unknown handler                       |
//! | 3    | invalid parameters                    |
//!
//! Logs go to stderr, where the manager relays them.
//!
//! ```bash
//! datasource-launcher --datasource EchoHandler --params '{"n": 5}' \
//!     --progress-channel progress_abc --bus-frontend tcp://127.0.0.1:5555
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use datasource_bus::{EventPublisher, Transport, ZmqPublisher};
use datasource_manager::progress::OfflinePublisher;
use datasource_manager::runner::{EXIT_HANDLER_FAILED, EXIT_OK, EXIT_UNKNOWN_HANDLER};
use datasource_manager::topics::DEFAULT_PROGRESS_TOPIC;
use datasource_manager::{DatasourceConfig, HandlerRegistry, JobRunner};
use tracing::{debug, error, info, warn, Instrument};

/// Runs a single data-source handler and reports progress on the bus.
#[derive(Parser, Debug)]
#[command(name = "datasource-launcher", version, about)]
struct Cli {
    /// Handler identifier, e.g. `EchoHandler`.
    #[arg(long)]
    datasource: String,

    /// Handler parameters as a JSON object.
    #[arg(long)]
    params: String,

    /// Topic to publish progress events on.
    #[arg(long, default_value = DEFAULT_PROGRESS_TOPIC)]
    progress_channel: String,

    /// Broker frontend to publish to. Defaults to the configured bus.
    #[arg(long)]
    bus_frontend: Option<String>,

    /// Configuration file (default: config/datasource.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pause after connecting and before exiting, in milliseconds.
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Request id of the command that started this job, for log correlation.
    #[arg(long)]
    request_id: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let span = tracing::info_span!(
        "job",
        request_id = cli.request_id.as_deref().unwrap_or("-"),
        pid = std::process::id()
    );
    let code = run(cli).instrument(span).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let config = match DatasourceConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return EXIT_HANDLER_FAILED;
        }
    };
    let registry = match HandlerRegistry::builtin() {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "handler registry is inconsistent");
            return EXIT_HANDLER_FAILED;
        }
    };
    // Nothing to run, so there is no point in waiting for the bus.
    if !registry.contains(&cli.datasource) {
        error!(datasource = %cli.datasource, known = ?registry.names(), "unknown handler");
        return EXIT_UNKNOWN_HANDLER;
    }
    debug!(handlers = ?registry.names(), "handler registry loaded");

    let settle = cli
        .settle_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or_else(|| config.launcher.settle());

    let frontend = cli.bus_frontend.unwrap_or_else(|| config.bus.frontend.clone());
    let publisher = connect_publisher(&frontend).await;

    // Lets the broker learn about this publisher before the first event.
    tokio::time::sleep(settle).await;

    let runner = JobRunner::new(registry, publisher).publish_timeout(config.launcher.publish_timeout());
    let result = runner
        .run_json(&cli.datasource, &cli.params, &cli.progress_channel)
        .await;

    // Give the last progress events time to leave the socket.
    tokio::time::sleep(settle).await;

    match result {
        Ok(report) => {
            info!(
                handler = %report.handler,
                progress_topic = %report.progress_topic,
                elapsed = ?report.elapsed,
                "job complete"
            );
            EXIT_OK
        }
        Err(e) => {
            let code = e.exit_code();
            error!(error = %e, exit_code = code, "job failed");
            code
        }
    }
}

/// A live publisher, or one that drops everything when the bus is unreachable.
/// Progress is best-effort, so an unreachable bus does not fail the job.
async fn connect_publisher(frontend: &str) -> Arc<dyn EventPublisher> {
    let connected = match Transport::parse(frontend) {
        Ok(transport) => ZmqPublisher::connect(&transport).await,
        Err(e) => Err(e),
    };
    match connected {
        Ok(publisher) => {
            info!(endpoint = %frontend, "connected to bus");
            Arc::new(publisher)
        }
        Err(e) => {
            warn!(endpoint = %frontend, error = %e, "bus unavailable, progress will be dropped");
            Arc::new(OfflinePublisher::new(frontend, e.to_string()))
        }
    }
}
