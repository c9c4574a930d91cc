#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bletether
//!
//! A Rust library for maintaining a resilient command link to a single
//! Bluetooth Low Energy peripheral.
//!
//! The centerpiece is [`LinkManager`]: it connects to a peripheral, resolves
//! the device's command endpoint (a well-known GATT service/characteristic
//! pair), subscribes to unsolicited notifications, and then keeps the link
//! alive indefinitely: any unexpected drop triggers a background supervisor
//! that retries on a fixed cadence until the caller explicitly disconnects.
//! On top of the maintained link it exposes a text command channel and live
//! byte-level throughput statistics.
//!
//! The radio stack itself is abstracted behind the [`Transport`] trait.
//! A production implementation over `btleplug` is provided in [`ble`]; the
//! `mock-transport` feature compiles a scripted in-memory transport for
//! driving the manager in tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bletether::{ble::BtleTransport, LinkEvent, LinkManager};
//!
//! # async fn demo(transport: Arc<BtleTransport>, peripheral: bletether::PeripheralHandle) {
//! let manager = LinkManager::new();
//! let mut events = manager.subscribe();
//!
//! if manager.connect_and_maintain(transport, peripheral).await {
//!     manager.send_command("status").await;
//! }
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         LinkEvent::StateChanged => println!("connected: {}", manager.is_connected().await),
//!         LinkEvent::StatsChanged => println!("{}", manager.throughput_summary().await),
//!     }
//! }
//!
//! manager.disconnect().await;
//! # }
//! ```

/// Production transport implementation over btleplug
pub mod ble;
/// Command endpoint resolution and notification arming
pub mod endpoint;
/// Error types and handling
pub mod error;
/// Device connection manager and reconnection supervisor
pub mod manager;
/// Byte-level throughput accounting
pub mod stats;
/// Transport adapter abstraction consumed by the manager
pub mod transport;

#[cfg(any(test, feature = "mock-transport"))]
/// Scripted in-memory transport for tests
pub mod mock;

// Re-export the main types for convenient usage.
pub use error::{Result, TetherError};
pub use manager::{LinkConfig, LinkEvent, LinkManager};
pub use stats::ThroughputStats;
pub use transport::{
    CharacteristicRef, CommandEndpoint, PeripheralHandle, ServiceRef, Transport, TransportEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service UUID of the peripheral's command channel
///
/// The firmware exposes a single custom service carrying the command
/// characteristic. This identifier is fixed configuration, not negotiated
/// at runtime.
pub const COMMAND_SERVICE_UUID: &str = "9b2a1c50-4f66-4c3e-9a6b-6f0c6b2f3a01";

/// Characteristic UUID used for command writes and value notifications
///
/// A single characteristic serves both directions: outbound command payloads
/// are written to it, and the peripheral pushes unsolicited value updates
/// through it once notifications are armed.
pub const COMMAND_CHAR_UUID: &str = "9b2a1c50-4f66-4c3e-9a6b-6f0c6b2f3a02";
