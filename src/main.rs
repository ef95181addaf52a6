use anyhow::Context;
use ble_gateway::domain::settings::SettingsService;
use ble_gateway::gateway::Gateway;
use ble_gateway::infrastructure::bus::LocalBus;
use ble_gateway::infrastructure::logging;
use ble_gateway::infrastructure::radio::btle::{BtleRadio, LinkUuids};
use ble_gateway::infrastructure::radio::RadioHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional explicit settings path, otherwise the platform config dir.
    let settings_service = match std::env::args().nth(1) {
        Some(path) => SettingsService::from_path(path.into())
            .context("failed to load settings file")?,
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)?;
    info!("Starting BLE gateway '{}'", settings.gateway_id);

    let uuids = LinkUuids::from_settings(&settings)?;
    let radio = RadioHandle::new(BtleRadio::new(uuids).await?);

    // In-process bus; external transports attach through the MessageBus
    // trait in place of LocalBus.
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();
    let bus = Arc::new(LocalBus::new(bus_tx));

    let gateway = Gateway::new(&settings, radio, bus, bus_rx);

    let shutdown = gateway.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    gateway.run().await;
    Ok(())
}
