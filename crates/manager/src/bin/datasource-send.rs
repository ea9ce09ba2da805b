//! datasource-send: sends one `start_data_source` command and prints the reply.
//!
//! Exit code 0 on a `success` response, 1 on `failed`/`rejected` or an
//! error, 2 when no response arrives in time.
//!
//! ```bash
//! datasource-send --datasource EchoHandler --params '{"n": 5}' --progress
//! datasource-send --manager 10.0.0.7 --datasource EchoHandler --params '{"n": 3}' --timeout-secs 30
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use datasource_manager::{net, ClientError, CommandClient, DatasourceConfig, HandlerParams, ProgressEvent};
use tokio::sync::mpsc;

/// Sends a start_data_source command to a manager and waits for its response.
#[derive(Parser, Debug)]
#[command(name = "datasource-send", version, about)]
struct Cli {
    /// Manager host address (default: this host's address).
    #[arg(long)]
    manager: Option<String>,

    /// Handler identifier to start.
    #[arg(long)]
    datasource: String,

    /// Handler parameters as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,

    /// Seconds to wait for the response (default from config, 15).
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print progress events while waiting.
    #[arg(long)]
    progress: bool,

    /// Configuration file (default: config/datasource.toml if present).
    #[arg(long, env = "DATASOURCE_CONFIG")]
    config: Option<PathBuf>,
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
        .init();

    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "send failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = DatasourceConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let params = parse_params(&cli.params)?;
    let manager = cli.manager.unwrap_or_else(|| net::local_ip().to_string());
    let timeout = cli
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.client.timeout());

    let client = CommandClient::connect(&config.bus)
        .await
        .context("failed to connect to bus")?
        .subscribe_settle(config.client.subscribe_settle());

    let result = if cli.progress {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                println!(
                    "progress {:>3}% {} {}/{} eta {:.1}s (pid {})",
                    event.progress_percent, event.name, event.processed, event.total, event.estimated_time, event.pid
                );
            }
        });
        let result = client
            .send_with_progress(&manager, &cli.datasource, params, timeout, tx)
            .await;
        let _ = printer.await;
        result
    } else {
        client.send(&manager, &cli.datasource, params, timeout).await
    };

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(if response.is_success() { 0 } else { 1 })
        }
        Err(ClientError::Timeout(waited)) => {
            eprintln!("no response within {waited:?}");
            Ok(2)
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_params(raw: &str) -> anyhow::Result<HandlerParams> {
    match serde_json::from_str(raw).context("--params is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--params must be a JSON object, got {other}"),
    }
}
