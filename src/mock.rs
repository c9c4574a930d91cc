//! Scripted in-memory transport for exercising the connection manager
//! without a radio.
//!
//! The mock plays back queued connect outcomes, exposes knobs for the shape
//! of the remote GATT table (service/characteristic presence, capability
//! flags, arming failures), records every call the manager makes, and lets a
//! test inject link-loss and notification events as if they came from the
//! radio stack.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::{Result, TetherError},
    transport::{CharacteristicRef, PeripheralHandle, ServiceRef, Transport, TransportEvent},
    COMMAND_CHAR_UUID, COMMAND_SERVICE_UUID,
};

#[derive(Debug)]
struct MockInner {
    connect_script: VecDeque<std::result::Result<(), String>>,
    service_present: bool,
    characteristic_present: bool,
    can_write: bool,
    can_notify: bool,
    fail_notify_arm: bool,
    write_failure: Option<String>,
    connect_calls: usize,
    disconnect_calls: usize,
    find_service_calls: usize,
    notify_started: usize,
    notify_stopped: usize,
    writes: Vec<Bytes>,
}

impl Default for MockInner {
    fn default() -> Self {
        Self {
            connect_script: VecDeque::new(),
            service_present: true,
            characteristic_present: true,
            can_write: true,
            can_notify: true,
            fail_notify_arm: false,
            write_failure: None,
            connect_calls: 0,
            disconnect_calls: 0,
            find_service_calls: 0,
            notify_started: 0,
            notify_stopped: 0,
            writes: Vec::new(),
        }
    }
}

/// In-memory [`Transport`] with scripted behavior and call recording
///
/// By default every operation succeeds and the remote GATT table contains
/// the command channel with write and notify capabilities. Queue connect
/// outcomes with [`queue_connect_error`](Self::queue_connect_error); an empty
/// queue means connects succeed.
#[derive(Debug)]
pub struct MockTransport {
    inner: Mutex<MockInner>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock with the happy-path defaults
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(MockInner::default()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue a failing outcome for the next connect call
    pub fn queue_connect_error(&self, message: &str) {
        self.lock().connect_script.push_back(Err(message.to_string()));
    }

    /// Queue a succeeding outcome for the next connect call
    pub fn queue_connect_ok(&self) {
        self.lock().connect_script.push_back(Ok(()));
    }

    /// Control whether the command service is present on the peripheral
    pub fn set_service_present(&self, present: bool) {
        self.lock().service_present = present;
    }

    /// Control whether the command characteristic is present
    pub fn set_characteristic_present(&self, present: bool) {
        self.lock().characteristic_present = present;
    }

    /// Control the characteristic's write capability flag
    pub fn set_can_write(&self, can_write: bool) {
        self.lock().can_write = can_write;
    }

    /// Control the characteristic's notify capability flag
    pub fn set_can_notify(&self, can_notify: bool) {
        self.lock().can_notify = can_notify;
    }

    /// Make notification arming fail at the transport level
    pub fn fail_notify_arm(&self, fail: bool) {
        self.lock().fail_notify_arm = fail;
    }

    /// Make characteristic writes fail with the given message
    pub fn fail_writes(&self, message: &str) {
        self.lock().write_failure = Some(message.to_string());
    }

    /// Restore writes to the succeeding default
    pub fn pass_writes(&self) {
        self.lock().write_failure = None;
    }

    /// Inject an unexpected link-loss event for the given peripheral identity
    pub fn emit_link_lost(&self, peripheral: Uuid) {
        let _ = self.events.send(TransportEvent::LinkLost { peripheral });
    }

    /// Inject an unsolicited value update from a characteristic
    pub fn emit_notification(&self, characteristic: Uuid, payload: &[u8]) {
        let _ = self.events.send(TransportEvent::Notification {
            characteristic,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Inject a value update from the command characteristic
    pub fn emit_command_notification(&self, payload: &[u8]) {
        let characteristic = Uuid::parse_str(COMMAND_CHAR_UUID).expect("fixed UUID parses");
        self.emit_notification(characteristic, payload);
    }

    /// Number of connect calls observed
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    /// Number of disconnect calls observed
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    /// Number of service discovery calls observed
    #[must_use]
    pub fn find_service_calls(&self) -> usize {
        self.lock().find_service_calls
    }

    /// Number of start-notifications calls observed
    #[must_use]
    pub fn notify_started(&self) -> usize {
        self.lock().notify_started
    }

    /// Number of stop-notifications calls observed
    #[must_use]
    pub fn notify_stopped(&self) -> usize {
        self.lock().notify_stopped
    }

    /// Payloads written to the peripheral, in order
    #[must_use]
    pub fn writes(&self) -> Vec<Bytes> {
        self.lock().writes.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _peripheral: &PeripheralHandle) -> Result<()> {
        let mut inner = self.lock();
        inner.connect_calls += 1;
        match inner.connect_script.pop_front() {
            Some(Err(message)) => Err(TetherError::Transport(message)),
            Some(Ok(())) | None => Ok(()),
        }
    }

    async fn disconnect(&self, _peripheral: &PeripheralHandle) -> Result<()> {
        self.lock().disconnect_calls += 1;
        Ok(())
    }

    async fn find_service(
        &self,
        _peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Option<ServiceRef>> {
        let mut inner = self.lock();
        inner.find_service_calls += 1;
        if inner.service_present {
            Ok(Some(ServiceRef { uuid: service }))
        } else {
            Ok(None)
        }
    }

    async fn find_characteristic(
        &self,
        _peripheral: &PeripheralHandle,
        service: &ServiceRef,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicRef>> {
        let inner = self.lock();
        if inner.characteristic_present {
            Ok(Some(CharacteristicRef {
                uuid: characteristic,
                service: service.uuid,
                can_write: inner.can_write,
                can_notify: inner.can_notify,
            }))
        } else {
            Ok(None)
        }
    }

    async fn write(
        &self,
        _peripheral: &PeripheralHandle,
        _characteristic: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(message) = inner.write_failure.clone() {
            return Err(TetherError::Transport(message));
        }
        inner.writes.push(Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn start_notifications(
        &self,
        _peripheral: &PeripheralHandle,
        _characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_notify_arm {
            return Err(TetherError::Transport("notify arm refused".to_string()));
        }
        inner.notify_started += 1;
        Ok(())
    }

    async fn stop_notifications(
        &self,
        _peripheral: &PeripheralHandle,
        _characteristic: &CharacteristicRef,
    ) -> Result<()> {
        self.lock().notify_stopped += 1;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
