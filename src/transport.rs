//! Transport adapter abstraction.
//!
//! The manager never talks to a radio stack directly. Everything it needs
//! from one is collected in the [`Transport`] trait: connect/disconnect
//! primitives, GATT discovery, characteristic writes, notification arming,
//! and an event stream carrying link-loss and inbound value updates. The
//! production implementation lives in [`crate::ble`]; tests use the scripted
//! transport from [`crate::mock`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Opaque reference to a remote peripheral
///
/// Carries the stable identity used to key link-loss events and a display
/// name for presentation. The handle is supplied by the transport (typically
/// from a scan the application performed) and is only referenced by the core,
/// never owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Stable unique identity of the peripheral
    pub id: Uuid,
    /// Last known advertised name
    pub name: String,
}

impl PeripheralHandle {
    /// Create a new handle
    #[must_use]
    pub const fn new(id: Uuid, name: String) -> Self {
        Self { id, name }
    }

    /// Display name, falling back when the peripheral advertised none
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Unknown device"
        } else {
            &self.name
        }
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.id)
    }
}

/// Reference to a discovered GATT service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Service UUID
    pub uuid: Uuid,
}

/// Reference to a discovered GATT characteristic with capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicRef {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the containing service
    pub service: Uuid,
    /// Whether the characteristic accepts writes
    pub can_write: bool,
    /// Whether the characteristic supports unsolicited value updates
    pub can_notify: bool,
}

/// The resolved command channel: service plus characteristic
///
/// At most one of these is cached per active connection; it must never be
/// consulted across a connection-identity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEndpoint {
    /// The containing service
    pub service: ServiceRef,
    /// The command/notification characteristic
    pub characteristic: CharacteristicRef,
}

/// Asynchronous events delivered by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link to the identified peripheral dropped unexpectedly
    LinkLost {
        /// Identity of the peripheral that disconnected
        peripheral: Uuid,
    },
    /// An unsolicited value arrived on a subscribed characteristic
    Notification {
        /// UUID of the characteristic that produced the value
        characteristic: Uuid,
        /// Raw value payload
        payload: Bytes,
    },
}

/// Abstract radio stack consumed by the connection manager
///
/// All calls are asynchronous and may fail; the manager catches every error
/// and translates it into recorded state rather than propagating it. The
/// event stream is a broadcast channel so the manager's event pump and any
/// diagnostic listener can observe it independently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection to the peripheral
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Tear down the connection to the peripheral
    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Locate a service on the connected peripheral
    ///
    /// A missing service is `Ok(None)`, not an error; only transport-level
    /// failures produce `Err`.
    async fn find_service(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Option<ServiceRef>>;

    /// Locate a characteristic within a previously found service
    async fn find_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceRef,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicRef>>;

    /// Write a payload to a characteristic
    async fn write(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<()>;

    /// Arm unsolicited value delivery on a characteristic
    async fn start_notifications(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()>;

    /// Disarm unsolicited value delivery on a characteristic
    async fn stop_notifications(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()>;

    /// Subscribe to link-loss and notification events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
