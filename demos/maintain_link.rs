//! Scan for the command service, tether the first matching peripheral, and
//! watch the link survive drops until Ctrl-C.

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use bletether::{ble::BtleTransport, LinkEvent, LinkManager, COMMAND_SERVICE_UUID};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let service_uuid = Uuid::parse_str(COMMAND_SERVICE_UUID)?;

    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or("no Bluetooth adapters available")?;

    info!("Scanning for peripherals advertising the command service...");
    adapter
        .start_scan(ScanFilter {
            services: vec![service_uuid],
        })
        .await?;
    sleep(Duration::from_secs(5)).await;
    adapter.stop_scan().await?;

    let mut found = None;
    for peripheral in adapter.peripherals().await? {
        if let Ok(Some(properties)) = peripheral.properties().await {
            if properties.services.contains(&service_uuid) {
                found = Some(peripheral);
                break;
            }
        }
    }
    let Some(peripheral) = found else {
        error!("No matching peripheral found");
        return Ok(());
    };

    let transport = Arc::new(BtleTransport::new(adapter).await?);
    let handle = transport.register_peripheral(peripheral).await;
    info!("Tethering {handle}");

    let link = LinkManager::new();
    let mut events = link.subscribe();

    if !link
        .connect_and_maintain(transport, handle)
        .await
    {
        error!(
            "Initial connection failed: {}",
            link.last_error().await.unwrap_or_default()
        );
        return Ok(());
    }

    info!("Link up. Drop the peripheral's power to watch the supervisor reconnect.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::StateChanged) => {
                    if link.is_connected().await {
                        info!("State: connected to {:?}", link.connected_peripheral().await);
                    } else if link.is_connecting().await {
                        info!("State: connecting...");
                    } else {
                        info!(
                            "State: disconnected (last error: {})",
                            link.last_error().await.unwrap_or_else(|| "none".to_string())
                        );
                    }
                }
                Ok(LinkEvent::StatsChanged) => {
                    info!("Throughput: {}", link.throughput_summary().await);
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Disconnecting");
    link.disconnect().await;
    Ok(())
}
