use anyhow::Result;
use btbattery::logging::init_logging;
use btbattery::{BatterySupervisor, Config};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional first argument: configuration file
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path, e))?,
        None => Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?,
    };

    init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let settings = config
        .resolve()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!(
        "btbattery {} starting: {} unit(s), {} topology",
        env!("APP_VERSION"),
        settings.units.len(),
        settings.topology
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    match run(BatterySupervisor::new(settings), shutdown_rx).await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Supervisor failed with error: {}", e);
            Err(anyhow::anyhow!("Supervisor error: {}", e))
        }
    }
}

#[cfg(feature = "ble")]
async fn run(supervisor: BatterySupervisor, shutdown: watch::Receiver<bool>) -> Result<()> {
    use btbattery::link::BleConnector;
    use btbattery::publish::LogPublisher;
    use std::sync::Arc;

    let connector = BleConnector::new()
        .await
        .map_err(|e| anyhow::anyhow!("Bluetooth unavailable: {}", e))?;
    let mut publisher = LogPublisher::default();
    supervisor
        .run(Arc::new(connector), &mut publisher, shutdown)
        .await?;
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn run(_supervisor: BatterySupervisor, _shutdown: watch::Receiver<bool>) -> Result<()> {
    anyhow::bail!("Bluetooth support was not compiled in; rebuild with --features ble")
}
