//! RouterOS Control-Channel Service (`rossrv`)
//!
//! Service entry point: parse arguments, initialize logging, assemble the
//! core, and run until a shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use rossrv::config::ServiceConfig;
use rossrv::error::Result;
use rossrv::service::RouterCore;

#[derive(Parser, Debug)]
#[command(name = "rossrv", about = "RouterOS API control-channel service")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/rossrv.yaml", env = "ROSSRV_CONFIG")]
    config: String,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = ServiceConfig::load(&args.config)?;
    info!(
        devices = config.devices.len(),
        config = %args.config,
        "Configuration loaded"
    );

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let core = Arc::new(RouterCore::new(config)?);
    core.start();
    info!("rossrv started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    core.shutdown().await;
    info!("rossrv stopped");
    Ok(())
}
