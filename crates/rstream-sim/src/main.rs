//! rstream-sim - scripted stream scenario runner
//!
//! Replays a scenario file through the reconnecting stream client and logs
//! every event the client dispatches.
//!
//! Usage:
//!   rstream-sim [OPTIONS] <scenario.toml>
//!
//! Logging follows `RUST_LOG`; `-v` raises the default level to debug.

mod scenario;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rstream_client::{DataPayload, StreamBuilder};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::scenario::Scenario;
use crate::transport::ScriptedTransport;

#[derive(Parser)]
#[command(name = "rstream-sim")]
#[command(author, version, about = "Replay scripted stream scenarios through the reconnecting client")]
struct Cli {
    /// Scenario file (TOML)
    scenario: PathBuf,

    /// Stop after this many milliseconds
    #[arg(short, long, env = "RSTREAM_SIM_DURATION_MS", default_value_t = 5_000)]
    duration_ms: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_logging(cli: &Cli) {
    let default_filter = if cli.verbose {
        "rstream_sim=debug,rstream_client=debug,rstream_core=debug"
    } else {
        "rstream_sim=info,rstream_client=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let scenario = Scenario::load_from(&cli.scenario)?;
    info!(
        scenario = %cli.scenario.display(),
        method = %scenario.method,
        connections = scenario.connections.len(),
        "Starting scenario"
    );

    let transport = Arc::new(ScriptedTransport::new(scenario.connections.clone()));
    let controller = StreamBuilder::new(transport.clone(), scenario.method.as_str())
        .with_request(scenario.request_bytes())
        .with_config(&scenario.client)
        .on_metadata(|_, metadata| info!(?metadata, "metadata"), None)
        .on_data(
            |_, payload| match payload {
                DataPayload::Structured(value) => info!(%value, "data"),
                DataPayload::Raw(bytes) => info!(bytes = bytes.len(), "data (raw)"),
            },
            None,
        )
        .on_end(|_| info!("end"), None)
        .on_error(|_, status| warn!(code = status.code, message = %status.message, "error"), None)
        .on_retry(
            |_, retry| info!(retries = retry.retries, backoff_ms = retry.backoff_millis, "retry"),
            None,
        )
        .start()
        .await;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(cli.duration_ms)) => {
            info!(duration_ms = cli.duration_ms, "Scenario time elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    info!(
        opens = transport.open_count(),
        retries = controller.retries(),
        state = %controller.state(),
        "Scenario finished"
    );

    Ok(())
}
