use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use device_pool::config::Cli;
use device_pool::config::Commands;
use device_pool::config::DaemonArgs;
use device_pool::config::PoolConfig;
use device_pool::logging;
use device_pool::manager;
use device_pool::manager::ResourceManager;
use device_pool::telemetry::nvml::NvmlTelemetry;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
    }
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    logging::init();

    let config = PoolConfig::from(&args);
    info!(
        mode = %config.split_mode,
        reservation = config.reservation_percent,
        "starting device pool daemon"
    );

    let telemetry = Arc::new(NvmlTelemetry::init()?);
    let manager: Arc<dyn ResourceManager> = manager::from_config(telemetry, &config).into();

    let devices = manager.devices()?;
    info!("advertising {} virtual devices", devices.len());

    let stop = CancellationToken::new();
    let (unhealthy_tx, unhealthy_rx) = mpsc::channel();

    let monitor = {
        let manager = manager.clone();
        let devices = devices.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || manager.check_health(&stop, &devices, &unhealthy_tx))
    };

    // Retractions are logged here; the RPC layer consuming them to update
    // the advertised pool lives outside this process core.
    let reporter = tokio::task::spawn_blocking(move || {
        for device in unhealthy_rx {
            warn!(id = %device.id, "virtual device retracted from the pool");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    stop.cancel();

    monitor.await??;
    reporter.await?;
    Ok(())
}
