//! The device connection manager.
//!
//! [`LinkManager`] owns the full lifecycle of the tether to one peripheral:
//! the connection session (connect, resolve the command endpoint, arm
//! notifications), the reconnection supervisor that keeps retrying after
//! unexpected drops, manual disconnect, command sends, and throughput
//! accounting. Three execution contexts converge on its state: the caller,
//! the supervisor task, and the transport event pump. All shared fields live
//! in a single mutex-guarded record; the lock is only ever held for short
//! field updates, never across a transport call.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    endpoint,
    error::TetherError,
    stats::ThroughputStats,
    transport::{CommandEndpoint, PeripheralHandle, Transport, TransportEvent},
};

/// Change notifications emitted by the manager
///
/// Delivery is over a broadcast channel and may drop intermediate states
/// under lag; the contract is that the final settled state is observable,
/// not that every transition is delivered to every observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connected/connecting/error/peripheral-identity changed
    StateChanged,
    /// A throughput counter changed
    StatsChanged,
}

/// Tunables for the reconnection supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long the supervisor sleeps between checks while connected
    pub idle_interval: Duration,
    /// How long the supervisor sleeps after a reconnect attempt
    pub retry_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(2),
            retry_interval: Duration::from_secs(3),
        }
    }
}

/// The manager's view of the current connection, guarded by one mutex
struct LinkState {
    transport: Option<Arc<dyn Transport>>,
    target: Option<PeripheralHandle>,
    connected: Option<PeripheralHandle>,
    connected_at: Option<SystemTime>,
    last_error: Option<String>,
    connecting: bool,
    manual_disconnect: bool,
    reconnect_stop: Option<watch::Sender<bool>>,
    endpoint: Option<CommandEndpoint>,
    notifications_armed: bool,
    stats: ThroughputStats,
    event_pump: Option<JoinHandle<()>>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            transport: None,
            target: None,
            connected: None,
            connected_at: None,
            last_error: None,
            connecting: false,
            manual_disconnect: false,
            reconnect_stop: None,
            endpoint: None,
            notifications_armed: false,
            stats: ThroughputStats::new(),
            event_pump: None,
        }
    }
}

struct Shared {
    state: Mutex<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    config: LinkConfig,
}

/// Extract the human-readable reason recorded on the shared error field
///
/// Transport failures surface the adapter's own message without wrapping,
/// matching what the presentation layer is expected to show.
fn error_reason(error: &TetherError) -> String {
    match error {
        TetherError::Transport(message) => message.clone(),
        TetherError::Ble(e) => e.to_string(),
        other => other.to_string(),
    }
}

impl Shared {
    fn emit_state(&self) {
        let _ = self.events.send(LinkEvent::StateChanged);
    }

    fn emit_stats(&self) {
        let _ = self.events.send(LinkEvent::StatsChanged);
    }

    async fn record_error(&self, reason: String) {
        {
            let mut state = self.state.lock().await;
            state.last_error = Some(reason);
        }
        self.emit_state();
    }

    /// One connection session: connect, resolve the endpoint best-effort,
    /// report success or failure through the connection record.
    async fn connect_once(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        peripheral: &PeripheralHandle,
    ) -> bool {
        {
            let mut state = self.state.lock().await;
            state.connecting = true;
            state.last_error = None;
            // A prior session's leftovers must never survive into a new one.
            state.endpoint = None;
            state.notifications_armed = false;
            state.stats.reset();
        }
        self.emit_state();

        debug!("Connecting to {peripheral}");
        if let Err(e) = transport.connect(peripheral).await {
            let reason = error_reason(&e);
            warn!("Connection to {peripheral} failed: {reason}");
            let mut state = self.state.lock().await;
            state.connected = None;
            state.connected_at = None;
            state.last_error = Some(reason);
            state.connecting = false;
            drop(state);
            self.emit_state();
            return false;
        }

        {
            let mut state = self.state.lock().await;
            if state.manual_disconnect {
                // A manual disconnect raced this attempt; the record stays
                // cleared and the stale success is superseded.
                state.connecting = false;
                drop(state);
                self.emit_state();
                return false;
            }
            state.connected = Some(peripheral.clone());
            state.connected_at = Some(SystemTime::now());
            state.endpoint = None;
            state.notifications_armed = false;
            state.stats.reset();
        }

        // Best-effort: a connected-but-unresolved endpoint is an observable
        // degraded state, and command sends will fail with a distinct error.
        self.resolve_endpoint(transport, peripheral).await;

        {
            let mut state = self.state.lock().await;
            state.connecting = false;
        }
        self.emit_state();
        info!("Connected to {peripheral}");
        true
    }

    /// Return the cached command endpoint or run discovery for it.
    ///
    /// Discovery executes outside the lock; the result is only cached when
    /// the connection identity is unchanged, so a stale resolution can never
    /// address a write to a disconnected link.
    async fn resolve_endpoint(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        peripheral: &PeripheralHandle,
    ) -> Option<CommandEndpoint> {
        let already_armed = {
            let state = self.state.lock().await;
            if state.connected.as_ref().map(|p| p.id) != Some(peripheral.id) {
                return None;
            }
            if let Some(cached) = state.endpoint {
                return Some(cached);
            }
            state.notifications_armed
        };

        let (resolved, armed) =
            endpoint::resolve_and_arm(transport.as_ref(), peripheral, already_armed).await?;

        let mut state = self.state.lock().await;
        if state.connected.as_ref().map(|p| p.id) != Some(peripheral.id) {
            debug!("Discarding endpoint resolved against a stale connection");
            return None;
        }
        state.endpoint = Some(resolved);
        state.notifications_armed = armed;
        Some(resolved)
    }

    async fn connect_and_maintain(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
    ) -> bool {
        {
            let mut state = self.state.lock().await;
            state.transport = Some(Arc::clone(&transport));
            state.target = Some(peripheral.clone());
            state.manual_disconnect = false;

            // Re-register the transport event observer for this link.
            if let Some(pump) = state.event_pump.take() {
                pump.abort();
            }
            let events = transport.events();
            let shared = Arc::clone(self);
            state.event_pump = Some(tokio::spawn(shared.pump_events(events)));
        }

        let connected = self.connect_once(&transport, &peripheral).await;
        if connected {
            self.start_reconnect_loop(transport, peripheral).await;
        }
        connected
    }

    async fn disconnect(&self) {
        let (stop, pump, transport, peripheral, cached, armed) = {
            let mut state = self.state.lock().await;
            // Flag first, so concurrent link-loss events and in-flight
            // reconnect attempts observe it and back off.
            state.manual_disconnect = true;
            (
                state.reconnect_stop.take(),
                state.event_pump.take(),
                state.transport.take(),
                state.connected.take(),
                state.endpoint.take(),
                std::mem::take(&mut state.notifications_armed),
            )
        };

        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        if let (Some(transport), Some(peripheral)) = (transport, peripheral) {
            if let Some(endpoint) = cached {
                endpoint::teardown(transport.as_ref(), &peripheral, endpoint, armed).await;
            }
            if let Err(e) = transport.disconnect(&peripheral).await {
                debug!("Ignoring disconnect error on {peripheral}: {e}");
            }
            info!("Disconnected from {peripheral}");
        }

        {
            let mut state = self.state.lock().await;
            state.target = None;
            state.connected = None;
            state.connected_at = None;
            state.last_error = None;
            state.connecting = false;
            state.endpoint = None;
            state.notifications_armed = false;
            state.stats.reset();
        }
        self.emit_state();
    }

    async fn send_command(self: &Arc<Self>, text: &str) -> bool {
        if text.trim().is_empty() {
            self.record_error(error_reason(&TetherError::EmptyCommand))
                .await;
            return false;
        }

        let snapshot = {
            let state = self.state.lock().await;
            state.transport.clone().zip(state.connected.clone())
        };
        let Some((transport, peripheral)) = snapshot else {
            self.record_error(error_reason(&TetherError::NotConnected))
                .await;
            return false;
        };

        let Some(endpoint) = self.resolve_endpoint(&transport, &peripheral).await else {
            self.record_error(error_reason(&TetherError::EndpointUnresolved))
                .await;
            return false;
        };

        if !endpoint.characteristic.can_write {
            self.record_error(error_reason(&TetherError::EndpointNotWritable))
                .await;
            return false;
        }

        let payload = Bytes::from(text.as_bytes().to_vec());
        if let Err(e) = transport
            .write(&peripheral, &endpoint.characteristic, &payload)
            .await
        {
            let reason = error_reason(&e);
            warn!("Command write to {peripheral} failed: {reason}");
            self.record_error(reason).await;
            return false;
        }

        debug!("Wrote {} byte command to {peripheral}", payload.len());
        {
            let mut state = self.state.lock().await;
            state.stats.record_tx(payload.len());
            state.last_error = None;
        }
        self.emit_stats();
        self.emit_state();
        true
    }

    /// Pump link-loss and value-update events from the transport.
    async fn pump_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::LinkLost { peripheral }) => {
                    self.handle_link_loss(peripheral).await;
                }
                Ok(TransportEvent::Notification {
                    characteristic,
                    payload,
                }) => {
                    self.handle_notification(characteristic, &payload).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Transport event stream lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Count an unsolicited value from the subscribed endpoint.
    async fn handle_notification(&self, characteristic: Uuid, payload: &Bytes) {
        if payload.is_empty() {
            return;
        }

        let counted = {
            let mut state = self.state.lock().await;
            match state.endpoint {
                Some(endpoint)
                    if state.notifications_armed
                        && endpoint.characteristic.uuid == characteristic =>
                {
                    state.stats.record_rx(payload.len());
                    true
                }
                _ => false,
            }
        };

        if counted {
            self.emit_stats();
        }
    }

    /// React to an unexpected drop reported by the transport.
    async fn handle_link_loss(self: &Arc<Self>, peripheral_id: Uuid) {
        let (transport, peripheral, cached, armed) = {
            let mut state = self.state.lock().await;
            if state.manual_disconnect {
                // Manual disconnect owns the teardown sequence.
                return;
            }
            let peripheral = match &state.connected {
                Some(p) if p.id == peripheral_id => p.clone(),
                _ => {
                    debug!("Ignoring stale link-loss event for {peripheral_id}");
                    return;
                }
            };
            state.connected = None;
            state.connected_at = None;
            let cached = state.endpoint.take();
            let armed = std::mem::take(&mut state.notifications_armed);
            state.stats.reset();
            (state.transport.clone(), peripheral, cached, armed)
        };

        warn!("Link to {peripheral} lost, scheduling reconnection");

        if let (Some(transport), Some(endpoint)) = (&transport, cached) {
            endpoint::teardown(transport.as_ref(), &peripheral, endpoint, armed).await;
        }

        self.emit_state();

        if let Some(transport) = transport {
            self.start_reconnect_loop(transport, peripheral).await;
        }
    }

    /// Start the reconnection supervisor if none is running.
    async fn start_reconnect_loop(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
    ) {
        let stop = {
            let mut state = self.state.lock().await;
            if state.manual_disconnect {
                return;
            }
            if state.reconnect_stop.is_some() {
                // At most one supervisor loop per manager.
                return;
            }
            let (tx, rx) = watch::channel(false);
            state.reconnect_stop = Some(tx);
            rx
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.reconnect_loop(transport, peripheral, stop).await;
        });
    }

    /// Watch the link while connected; retry the session while not.
    ///
    /// Unbounded retries on a fixed cadence, no backoff: the design favors
    /// eventual reconnection over giving up. Steady-state watching relies on
    /// link-loss events to clear the connected state rather than polling the
    /// transport.
    async fn reconnect_loop(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!("Reconnection supervisor started for {peripheral}");

        loop {
            if *stop.borrow() {
                break;
            }

            let (manual, connected) = {
                let state = self.state.lock().await;
                (state.manual_disconnect, state.connected.is_some())
            };
            if manual {
                break;
            }

            if connected {
                if interruptible_sleep(self.config.idle_interval, &mut stop).await {
                    break;
                }
                continue;
            }

            self.connect_once(&transport, &peripheral).await;

            if interruptible_sleep(self.config.retry_interval, &mut stop).await {
                break;
            }
        }

        debug!("Reconnection supervisor stopped for {peripheral}");
    }
}

/// Sleep that honors the supervisor's cancellation signal.
///
/// Returns `true` when cancelled, so manual disconnect stops the loop within
/// one interval instead of waiting out a full sleep.
async fn interruptible_sleep(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        _ = stop.changed() => true,
    }
}

/// Maintains a resilient command link to a single BLE peripheral
///
/// `LinkManager` establishes a connection over an abstract [`Transport`],
/// resolves and caches the peripheral's command endpoint, subscribes to its
/// notifications, and re-establishes the link after any unexpected drop
/// until [`disconnect`](Self::disconnect) is called. Observers follow state
/// and throughput changes through [`subscribe`](Self::subscribe).
///
/// None of the public operations return errors: each resolves to a success
/// flag, and the human-readable failure reason is recorded on the shared
/// error field surfaced by [`last_error`](Self::last_error).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use bletether::{ble::BtleTransport, LinkManager};
///
/// # async fn demo(transport: Arc<BtleTransport>, peripheral: bletether::PeripheralHandle) {
/// let manager = LinkManager::new();
/// if manager.connect_and_maintain(transport, peripheral).await {
///     manager.send_command("led on").await;
///     println!("{}", manager.throughput_summary().await);
/// }
/// manager.disconnect().await;
/// # }
/// ```
pub struct LinkManager {
    shared: Arc<Shared>,
}

impl LinkManager {
    /// Create a manager with the default supervisor cadence
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    /// Create a manager with custom supervisor intervals
    #[must_use]
    pub fn with_config(config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::default()),
                events,
                config,
            }),
        }
    }

    /// Subscribe to state-changed and stats-changed notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Supervisor cadence in effect
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Connect to the peripheral and keep the link alive until
    /// [`disconnect`](Self::disconnect)
    ///
    /// Returns whether the initial connection attempt succeeded. The
    /// reconnection supervisor only starts after a successful first
    /// connection; a failed first attempt records the reason and leaves the
    /// manager idle.
    pub async fn connect_and_maintain(
        &self,
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
    ) -> bool {
        self.shared.connect_and_maintain(transport, peripheral).await
    }

    /// Tear down the link and suppress automatic reconnection
    ///
    /// Safe to call when already disconnected. Teardown and transport errors
    /// are swallowed: the goal state is "not connected" regardless.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await;
    }

    /// Write a text command to the resolved command endpoint
    ///
    /// Returns `false` without touching the transport for blank input, a
    /// missing connection, an unresolved endpoint, or a non-writable
    /// characteristic; the specific reason is recorded on
    /// [`last_error`](Self::last_error). No implicit retry is performed.
    pub async fn send_command(&self, text: &str) -> bool {
        self.shared.send_command(text).await
    }

    /// Whether a peripheral is currently connected
    pub async fn is_connected(&self) -> bool {
        self.shared.state.lock().await.connected.is_some()
    }

    /// Whether a connection attempt is in progress
    pub async fn is_connecting(&self) -> bool {
        self.shared.state.lock().await.connecting
    }

    /// Whether the reconnection supervisor is running
    pub async fn is_reconnect_active(&self) -> bool {
        self.shared.state.lock().await.reconnect_stop.is_some()
    }

    /// Identity and name of the connected peripheral, if any
    pub async fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.shared.state.lock().await.connected.clone()
    }

    /// UTC timestamp of the successful connection, if connected
    pub async fn connected_at(&self) -> Option<SystemTime> {
        self.shared.state.lock().await.connected_at
    }

    /// Human-readable reason of the most recent failure, if any
    pub async fn last_error(&self) -> Option<String> {
        self.shared.state.lock().await.last_error.clone()
    }

    /// Whether a failure reason is currently recorded
    pub async fn has_error(&self) -> bool {
        self.shared.state.lock().await.last_error.is_some()
    }

    /// Snapshot of the current session's throughput counters
    pub async fn throughput(&self) -> ThroughputStats {
        self.shared.state.lock().await.stats.clone()
    }

    /// Formatted throughput summary for presentation
    pub async fn throughput_summary(&self) -> String {
        self.shared.state.lock().await.stats.summary()
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn peripheral() -> PeripheralHandle {
        PeripheralHandle::new(Uuid::new_v4(), "ESP32-C3-BLE".to_string())
    }

    fn drain(events: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    /// Let spawned tasks (event pump, supervisor) run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_success() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let device = peripheral();

        let ok = manager
            .connect_and_maintain(transport.clone(), device.clone())
            .await;

        assert!(ok);
        assert!(manager.is_connected().await);
        assert!(!manager.is_connecting().await);
        assert!(!manager.has_error().await);
        assert!(manager.connected_at().await.is_some());
        assert_eq!(manager.connected_peripheral().await, Some(device));
        assert!(manager.is_reconnect_active().await);
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(transport.notify_started(), 1);
    }

    #[tokio::test]
    async fn test_connect_emits_progress_and_completion_states() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let mut events = manager.subscribe();

        manager
            .connect_and_maintain(transport, peripheral())
            .await;

        let state_changes = drain(&mut events)
            .into_iter()
            .filter(|e| *e == LinkEvent::StateChanged)
            .count();
        // One for the in-progress state, one on completion.
        assert_eq!(state_changes, 2);
    }

    #[tokio::test]
    async fn test_connect_transport_failure_records_reason() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_connect_error("timeout");
        let manager = LinkManager::new();

        let ok = manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;

        assert!(!ok);
        assert!(!manager.is_connected().await);
        assert_eq!(manager.last_error().await.as_deref(), Some("timeout"));
        // The supervisor only starts after a successful first connection.
        assert!(!manager.is_reconnect_active().await);
    }

    #[tokio::test]
    async fn test_blank_commands_rejected_without_transport_calls() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();

        assert!(!manager.send_command("").await);
        assert!(!manager.send_command("   ").await);

        assert!(manager.has_error().await);
        assert_eq!(transport.connect_calls(), 0);
        assert_eq!(transport.find_service_calls(), 0);
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_connection_rejected() {
        let manager = LinkManager::new();

        assert!(!manager.send_command("ping").await);
        assert_eq!(
            manager.last_error().await.as_deref(),
            Some("no peripheral connected")
        );
    }

    #[tokio::test]
    async fn test_send_success_counts_bytes_once() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;
        let mut events = manager.subscribe();

        assert!(manager.send_command("ping").await);

        assert_eq!(manager.throughput().await.tx_bytes(), 4);
        assert!(!manager.has_error().await);
        assert_eq!(transport.writes(), vec![Bytes::from_static(b"ping")]);

        let stats_changes = drain(&mut events)
            .into_iter()
            .filter(|e| *e == LinkEvent::StatsChanged)
            .count();
        assert_eq!(stats_changes, 1);
    }

    #[tokio::test]
    async fn test_send_with_unresolved_endpoint_rejected() {
        let transport = Arc::new(MockTransport::new());
        transport.set_service_present(false);
        let manager = LinkManager::new();

        // Connection succeeds even though the endpoint cannot resolve.
        assert!(
            manager
                .connect_and_maintain(transport.clone(), peripheral())
                .await
        );
        assert!(manager.is_connected().await);

        assert!(!manager.send_command("ping").await);
        assert_eq!(
            manager.last_error().await.as_deref(),
            Some("command endpoint not resolved")
        );
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_non_writable_endpoint_rejected() {
        let transport = Arc::new(MockTransport::new());
        transport.set_can_write(false);
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;

        assert!(!manager.send_command("ping").await);
        assert_eq!(
            manager.last_error().await.as_deref(),
            Some("command endpoint is not writable")
        );
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_transport_reason() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;

        transport.fail_writes("write refused");
        assert!(!manager.send_command("ping").await);
        assert_eq!(
            manager.last_error().await.as_deref(),
            Some("write refused")
        );
        assert_eq!(manager.throughput().await.tx_bytes(), 0);

        // A later successful send clears the recorded reason.
        transport.pass_writes();
        assert!(manager.send_command("ping").await);
        assert!(!manager.has_error().await);
    }

    #[tokio::test]
    async fn test_endpoint_resolution_is_cached() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;

        // Resolution happened once during the session.
        assert_eq!(transport.find_service_calls(), 1);

        assert!(manager.send_command("one").await);
        assert!(manager.send_command("two").await);

        // Sends hit the cache; zero additional discovery calls.
        assert_eq!(transport.find_service_calls(), 1);
        assert_eq!(transport.notify_started(), 1);
    }

    #[tokio::test]
    async fn test_inbound_notification_counts_bytes() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;
        let mut events = manager.subscribe();

        transport.emit_command_notification(b"abc");
        settle().await;

        assert_eq!(manager.throughput().await.rx_bytes(), 3);
        let stats_changes = drain(&mut events)
            .into_iter()
            .filter(|e| *e == LinkEvent::StatsChanged)
            .count();
        assert_eq!(stats_changes, 1);
    }

    #[tokio::test]
    async fn test_empty_and_foreign_notifications_ignored() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;
        let mut events = manager.subscribe();

        transport.emit_command_notification(b"");
        transport.emit_notification(Uuid::new_v4(), b"not ours");
        settle().await;

        assert_eq!(manager.throughput().await.rx_bytes(), 0);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_triggers_reconnection() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let device = peripheral();
        manager
            .connect_and_maintain(transport.clone(), device.clone())
            .await;
        assert!(manager.send_command("warmup").await);
        assert_eq!(manager.throughput().await.tx_bytes(), 6);

        transport.emit_link_lost(device.id);
        settle().await;

        assert!(!manager.is_connected().await);
        assert!(manager.is_reconnect_active().await);
        // Link loss tears the old subscription down.
        assert_eq!(transport.notify_stopped(), 1);

        // The supervisor reconnects within the retry cadence.
        tokio::time::sleep(manager.config().retry_interval * 2).await;
        settle().await;

        assert!(manager.is_connected().await);
        assert_eq!(transport.connect_calls(), 2);
        // Endpoint re-resolved and re-armed on the new connection.
        assert_eq!(transport.notify_started(), 2);
        // Counters belong to the new session.
        assert_eq!(manager.throughput().await.tx_bytes(), 0);
    }

    #[tokio::test]
    async fn test_stale_link_loss_ignored() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let device = peripheral();
        manager
            .connect_and_maintain(transport.clone(), device)
            .await;

        transport.emit_link_lost(Uuid::new_v4());
        settle().await;

        assert!(manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_supervisor_despite_repeated_link_loss() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let device = peripheral();
        manager
            .connect_and_maintain(transport.clone(), device.clone())
            .await;

        // Keep every retry failing so the loop stays in its retry phase.
        for _ in 0..8 {
            transport.queue_connect_error("still down");
        }
        transport.emit_link_lost(device.id);
        settle().await;
        transport.emit_link_lost(device.id);
        settle().await;

        let before = transport.connect_calls();
        tokio::time::sleep(manager.config().retry_interval * 3).await;
        settle().await;

        // One loop produces at most one attempt per retry interval; a second
        // loop would double the rate.
        let attempts = transport.connect_calls() - before;
        assert!(attempts >= 2, "supervisor stopped retrying: {attempts}");
        assert!(attempts <= 4, "more than one supervisor running: {attempts}");
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal_and_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let device = peripheral();
        manager
            .connect_and_maintain(transport.clone(), device.clone())
            .await;
        assert!(manager.send_command("bye").await);

        manager.disconnect().await;

        assert!(!manager.is_connected().await);
        assert!(!manager.is_reconnect_active().await);
        assert!(!manager.has_error().await);
        assert_eq!(manager.connected_peripheral().await, None);
        assert_eq!(manager.connected_at().await, None);
        assert_eq!(manager.throughput().await.tx_bytes(), 0);
        assert_eq!(transport.disconnect_calls(), 1);
        assert_eq!(transport.notify_stopped(), 1);

        // Stale link-loss events after disconnect change nothing.
        transport.emit_link_lost(device.id);
        settle().await;
        assert!(!manager.is_connected().await);
        assert!(!manager.is_reconnect_active().await);

        // Calling again is a no-op beyond the notification.
        manager.disconnect().await;
        assert_eq!(transport.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_supervisor_mid_retry() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        let device = peripheral();
        manager
            .connect_and_maintain(transport.clone(), device.clone())
            .await;

        for _ in 0..4 {
            transport.queue_connect_error("still down");
        }
        transport.emit_link_lost(device.id);
        settle().await;
        tokio::time::sleep(manager.config().retry_interval).await;
        settle().await;
        assert!(manager.is_reconnect_active().await);

        manager.disconnect().await;
        settle().await;

        let before = transport.connect_calls();
        tokio::time::sleep(manager.config().retry_interval * 3).await;
        settle().await;

        assert_eq!(transport.connect_calls(), before);
        assert!(!manager.is_reconnect_active().await);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_counters_reset_on_new_connection_attempt() {
        let transport = Arc::new(MockTransport::new());
        let manager = LinkManager::new();
        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;
        assert!(manager.send_command("data").await);
        assert_eq!(manager.throughput().await.tx_bytes(), 4);

        manager
            .connect_and_maintain(transport.clone(), peripheral())
            .await;
        assert_eq!(manager.throughput().await.tx_bytes(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_clears_prior_error_before_attempt() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_connect_error("timeout");
        let manager = LinkManager::new();
        let device = peripheral();

        assert!(
            !manager
                .connect_and_maintain(transport.clone(), device.clone())
                .await
        );
        assert_eq!(manager.last_error().await.as_deref(), Some("timeout"));

        // The next connect clears the prior reason before attempting.
        assert!(manager.connect_and_maintain(transport, device).await);
        assert!(!manager.has_error().await);
    }
}
