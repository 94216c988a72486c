//! Headless entry point for the crysdaq console.
//!
//! Loads configuration, assembles the console, opens the ports and runs the
//! dispatch loop until Ctrl-C, then executes the bounded graceful shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use crysdaq::config::Config;
use crysdaq::measurement::{BroadcastSink, LogActivity};
use crysdaq::Console;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "crysdaq", version, about = "Crystal-growth process-control console")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/crysdaq.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_from(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.application.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();

    info!("starting {}", config.application.name);

    // Downstream consumers (display, file writer) subscribe to this stream;
    // headless runs simply keep one receiver alive.
    let (sink, _measurements) = BroadcastSink::new(256);
    let mut console = Console::new(config, Arc::new(sink), Arc::new(LogActivity))
        .context("failed to assemble console")?;

    console.connect().await.context("failed to open ports")?;
    console.start();
    info!("console running, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    console.shutdown().await;
    Ok(())
}
