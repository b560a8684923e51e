#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Rosette system orchestrator.
//!
//! Loads the TOML configuration, builds the shared services, registers the
//! built-in infrastructure nodes with a supervisor, and runs until Ctrl-C or
//! the requested duration elapses.

mod config;
mod nodes;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use rosette_supervisor::Supervisor;
use shared_logging::{LogLevel, MemorySink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::SystemConfig,
    nodes::{HeartbeatNode, TopicMonitorNode},
};

/// Rosette system orchestrator
#[derive(Parser, Debug)]
#[command(name = "system_orchestrator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration (missing file means defaults)
    #[arg(short, long, default_value = "rosette.toml")]
    config: PathBuf,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    duration_secs: Option<u64>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn wait_for_shutdown(duration_secs: Option<u64>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    match duration_secs {
        Some(secs) => {
            tokio::select! {
                signal = ctrl_c => signal.context("listening for ctrl-c")?,
                () = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!(secs, "run duration elapsed");
                }
            }
        }
        None => ctrl_c.await.context("listening for ctrl-c")?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = SystemConfig::load(&args.config)?;
    let memory = Arc::new(MemorySink::new(config.logging.memory_capacity));
    let diagnostics = config.build_diagnostics(Arc::clone(&memory))?;
    let services = config
        .build_services(diagnostics)
        .context("building services")?;

    let supervisor =
        Supervisor::new(services).with_stop_timeout(config.lifecycle.stop_timeout());
    let heartbeat = Arc::new(HeartbeatNode::default());
    let monitor = Arc::new(TopicMonitorNode::default());
    supervisor.add_node(heartbeat.clone())?;
    supervisor.add_node(monitor.clone())?;

    let started = supervisor.start_all().await;
    for failure in &started.failed {
        warn!(%failure, "node did not start");
    }
    info!(nodes = ?started.started, "orchestrator running");

    wait_for_shutdown(args.duration_secs).await?;

    let stopped = supervisor.stop_all().await;
    for failure in &stopped.failed {
        warn!(%failure, "node did not stop cleanly");
    }
    let status = supervisor.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    info!(
        heartbeats = heartbeat.sequence(),
        last_seen = monitor.last_heartbeat(),
        reports = monitor.reports(),
        errors = memory.at_least(LogLevel::Error).len(),
        "orchestrator stopped"
    );
    Ok(())
}
