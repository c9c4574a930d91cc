//! Tether a peripheral and send each stdin line as a command, printing the
//! throughput summary after every write.

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use bletether::{ble::BtleTransport, LinkManager, COMMAND_SERVICE_UUID};

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

    info!("Scanning...");
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

    let link = LinkManager::new();
    if !link.connect_and_maintain(transport, handle).await {
        error!(
            "Connection failed: {}",
            link.last_error().await.unwrap_or_default()
        );
        return Ok(());
    }

    info!("Connected. Type commands, one per line (Ctrl-D to quit).");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if link.send_command(&line).await {
            info!("Sent. {}", link.throughput_summary().await);
        } else {
            error!(
                "Rejected: {}",
                link.last_error().await.unwrap_or_default()
            );
        }
    }

    link.disconnect().await;
    Ok(())
}
