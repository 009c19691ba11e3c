//! tunnel-rs-vsock
//!
//! Enclave-side networking daemon. Creates a TAP device and bridges its
//! Ethernet frames over vsock to the host proxy, reconnecting forever until
//! SIGINT or SIGTERM.

#[cfg(not(target_os = "linux"))]
compile_error!("tunnel-rs-vsock only supports Linux");

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use tunnel_vsock::{BridgeConfig, StopSignal, Supervisor, VsockTapBackend};

#[derive(Parser)]
#[command(name = "tunnel-rs-vsock")]
#[command(version)]
#[command(about = "Bridge an enclave TAP device to a host proxy over vsock")]
struct Args {
    /// TOML configuration file (built-in defaults are used when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    let config = Arc::new(config);

    log::info!("tunnel-rs-vsock v{}", env!("CARGO_PKG_VERSION"));
    log::info!("  Host proxy: {}", config.transport);
    log::info!(
        "  Interface:  {} ({}, {}, mtu {})",
        config.interface.name,
        config.interface.mac,
        config.interface.address,
        config.interface.mtu
    );
    log::info!("  Gateway:    {}", config.interface.gateway);

    let (stop_tx, stop) = StopSignal::channel();
    install_stop_handlers(stop_tx)?;

    let backend = VsockTapBackend::new(config.clone());
    let stats = Supervisor::new(backend, config.retry_interval(), stop)
        .run()
        .await;

    log::info!(
        "Shut down after {} session attempts ({} retries)",
        stats.attempts,
        stats.retries
    );
    Ok(())
}

/// Publish stop on the first SIGINT or SIGTERM.
///
/// Listeners are registered before returning so a failure here is fatal.
fn install_stop_handlers(stop_tx: watch::Sender<bool>) -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT, stopping"),
            _ = sigterm.recv() => log::info!("Received SIGTERM, stopping"),
        }
        let _ = stop_tx.send(true);
    });

    Ok(())
}
