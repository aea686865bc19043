//! Wethlink Daemon - Main entry point
//!
//! Owns the transceiver context, runs the heartbeats and serves the
//! operator console API.

mod api;
mod config;
mod heartbeat;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wethlink_context::{IioCliStore, SimStore};
use wethlink_core::AttributeStore;
use wethlink_discovery::{describe_serial_ports, Endpoint, EndpointEnumerator, SerialEnumerator};

/// Ports of the simulated transceiver
const SIM_PORTS: &[&str] = &["/dev/ttyUSB0", "/dev/ttyUSB1"];

#[derive(Parser, Debug)]
#[command(name = "wethlink")]
#[command(about = "mmWave transceiver console daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wethlink.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Serve a simulated transceiver instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if args.list_ports {
        let ports = describe_serial_ports()?;
        println!("Found {} serial ports:", ports.len());
        for (name, kind) in ports {
            println!("  - {} ({})", name, kind);
        }
        return Ok(());
    }

    info!("Wethlink v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        refresh_ms = config.heartbeat.refresh_ms,
        health_ms = config.heartbeat.health_ms,
        discovery_ms = config.heartbeat.discovery_ms,
        monitors = config.monitors.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn AttributeStore>;
    let enumerator: Box<dyn EndpointEnumerator>;
    if args.simulate {
        warn!("Simulated transceiver, no hardware is touched");
        let sim = Arc::new(SimStore::transceiver(SIM_PORTS));
        let source = sim.clone();
        enumerator = Box::new(move || -> Result<Vec<Endpoint>> {
            Ok(source.ports().into_iter().map(Endpoint).collect())
        });
        store = sim;
    } else {
        store = Arc::new(IioCliStore::new(config.iio.clone()));
        enumerator = Box::new(SerialEnumerator::new(config.discovery.clone()));
    }

    let cancel = CancellationToken::new();
    let bind = config.daemon.bind.clone();
    let state = state::AppState::new(config, store, enumerator, cancel.clone());

    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal.cancel();
    });

    server::run(state, &bind, cancel).await
}
