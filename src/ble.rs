//! Production [`Transport`] implementation over btleplug.
//!
//! `BtleTransport` wraps a platform adapter and a registry of peripherals the
//! application discovered (scanning itself is out of scope for this crate:
//! the application scans with btleplug directly and registers the peripheral
//! it wants tethered). Disconnect events from the adapter and value updates
//! from subscribed characteristics are forwarded into the transport event
//! channel the manager consumes.

use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TetherError},
    transport::{CharacteristicRef, PeripheralHandle, ServiceRef, Transport, TransportEvent},
};

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

#[derive(Default)]
struct Registry {
    by_handle: HashMap<Uuid, Peripheral>,
    handle_by_platform: HashMap<PeripheralId, Uuid>,
}

/// btleplug-backed transport adapter
///
/// Holds the peripherals registered through
/// [`register_peripheral`](Self::register_peripheral) and translates between
/// the crate's opaque handles and btleplug's platform types.
pub struct BtleTransport {
    registry: Arc<Mutex<Registry>>,
    notify_tasks: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    events: broadcast::Sender<TransportEvent>,
    connect_timeout_ms: u64,
    _link_watch: JoinHandle<()>,
}

impl BtleTransport {
    /// Create a transport over the given adapter
    ///
    /// Spawns a background task forwarding the adapter's disconnect events
    /// into the transport event channel.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Ble`] if the adapter's event stream cannot be
    /// opened.
    pub async fn new(adapter: Adapter) -> Result<Self> {
        Self::with_timeout(adapter, DEFAULT_CONNECT_TIMEOUT_MS).await
    }

    /// Create a transport with a custom connect timeout
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Ble`] if the adapter's event stream cannot be
    /// opened.
    pub async fn with_timeout(adapter: Adapter, connect_timeout_ms: u64) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let registry = Arc::new(Mutex::new(Registry::default()));

        let mut central_events = adapter.events().await?;
        let watch_registry = Arc::clone(&registry);
        let watch_events = events.clone();
        let link_watch = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(platform_id) = event {
                    let handle_id = watch_registry
                        .lock()
                        .await
                        .handle_by_platform
                        .get(&platform_id)
                        .copied();
                    if let Some(peripheral) = handle_id {
                        debug!("Adapter reported disconnect of {peripheral}");
                        let _ = watch_events.send(TransportEvent::LinkLost { peripheral });
                    }
                }
            }
        });

        Ok(Self {
            registry,
            notify_tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
            connect_timeout_ms,
            _link_watch: link_watch,
        })
    }

    /// Create a transport over the first available Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Transport`] if no adapters are present, or
    /// [`TetherError::Ble`] if the platform manager cannot be initialized.
    pub async fn from_first_adapter() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TetherError::Transport("no Bluetooth adapters available".to_string()))?;
        Self::new(adapter).await
    }

    /// Register a peripheral the application discovered and obtain the
    /// opaque handle used for all subsequent operations
    pub async fn register_peripheral(&self, peripheral: Peripheral) -> PeripheralHandle {
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name.unwrap_or_default(),
            _ => String::new(),
        };

        let handle = PeripheralHandle::new(Uuid::new_v4(), name);
        let mut registry = self.registry.lock().await;
        registry
            .handle_by_platform
            .insert(peripheral.id(), handle.id);
        registry.by_handle.insert(handle.id, peripheral);
        handle
    }

    async fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.registry
            .lock()
            .await
            .by_handle
            .get(&handle.id)
            .cloned()
            .ok_or(TetherError::UnknownPeripheral(handle.id))
    }

    /// Forward the peripheral's notification stream into the event channel,
    /// one forwarder task per peripheral.
    async fn ensure_notification_forwarder(
        &self,
        handle: &PeripheralHandle,
        peripheral: &Peripheral,
    ) -> Result<()> {
        let mut tasks = self.notify_tasks.lock().await;
        if tasks.contains_key(&handle.id) {
            return Ok(());
        }

        let mut notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = notifications.next().await {
                let _ = events.send(TransportEvent::Notification {
                    characteristic: value.uuid,
                    payload: Bytes::from(value.value),
                });
            }
        });
        tasks.insert(handle.id, task);
        Ok(())
    }

    async fn stop_notification_forwarder(&self, handle: &PeripheralHandle) {
        if let Some(task) = self.notify_tasks.lock().await.remove(&handle.id) {
            task.abort();
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self._link_watch.abort();
    }
}

/// Derive the crate's capability flags from btleplug properties
fn capability_flags(properties: CharPropFlags) -> (bool, bool) {
    let can_write = properties.contains(CharPropFlags::WRITE)
        || properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE);
    let can_notify = properties.contains(CharPropFlags::NOTIFY)
        || properties.contains(CharPropFlags::INDICATE);
    (can_write, can_notify)
}

/// Locate the live btleplug characteristic matching a stored reference
fn lookup_characteristic(
    peripheral: &Peripheral,
    reference: &CharacteristicRef,
) -> Result<Characteristic> {
    peripheral
        .services()
        .iter()
        .filter(|s| s.uuid == reference.service)
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == reference.uuid)
        .cloned()
        .ok_or_else(|| {
            TetherError::Transport(format!("characteristic {} not present", reference.uuid))
        })
}

#[async_trait]
impl Transport for BtleTransport {
    async fn connect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;

        timeout(
            Duration::from_millis(self.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| TetherError::ConnectTimeout {
            timeout_ms: self.connect_timeout_ms,
        })??;

        peripheral.discover_services().await?;
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.stop_notification_forwarder(handle).await;
        let peripheral = self.peripheral(handle).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn find_service(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Option<ServiceRef>> {
        let peripheral = self.peripheral(handle).await?;
        Ok(peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| ServiceRef { uuid: s.uuid }))
    }

    async fn find_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: &ServiceRef,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicRef>> {
        let peripheral = self.peripheral(handle).await?;
        Ok(peripheral
            .services()
            .iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
            .map(|c| {
                let (can_write, can_notify) = capability_flags(c.properties);
                CharacteristicRef {
                    uuid: c.uuid,
                    service: service.uuid,
                    can_write,
                    can_notify,
                }
            }))
    }

    async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;
        let target = lookup_characteristic(&peripheral, characteristic)?;

        let write_type = if target.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        debug!("Writing {} bytes to {}", payload.len(), characteristic.uuid);
        peripheral.write(&target, payload, write_type).await?;
        Ok(())
    }

    async fn start_notifications(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;
        let target = lookup_characteristic(&peripheral, characteristic)?;

        self.ensure_notification_forwarder(handle, &peripheral)
            .await?;
        peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn stop_notifications(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;
        match lookup_characteristic(&peripheral, characteristic) {
            Ok(target) => peripheral.unsubscribe(&target).await?,
            // The link may already be gone along with its GATT table.
            Err(e) => warn!("Skipping unsubscribe: {e}"),
        }
        self.stop_notification_forwarder(handle).await;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
