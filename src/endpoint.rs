//! Resolution of the peripheral's command endpoint.
//!
//! The command channel is a fixed service/characteristic pair
//! ([`crate::COMMAND_SERVICE_UUID`], [`crate::COMMAND_CHAR_UUID`]). Discovery
//! runs at most once per connection lifetime: the manager caches the resolved
//! [`CommandEndpoint`] and consults the cache before calling back in here.
//! A missing service or characteristic is a degraded-but-connected state,
//! not a hard failure, so every outcome short of success collapses to `None`.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TetherError},
    transport::{CommandEndpoint, PeripheralHandle, Transport},
    COMMAND_CHAR_UUID, COMMAND_SERVICE_UUID,
};

/// Parse the fixed command channel identifiers
fn command_channel_ids() -> Result<(Uuid, Uuid)> {
    let service = Uuid::parse_str(COMMAND_SERVICE_UUID)
        .map_err(|e| TetherError::InvalidUuid(format!("service UUID: {e}")))?;
    let characteristic = Uuid::parse_str(COMMAND_CHAR_UUID)
        .map_err(|e| TetherError::InvalidUuid(format!("characteristic UUID: {e}")))?;
    Ok((service, characteristic))
}

/// Locate the command endpoint on a connected peripheral and arm
/// notifications on it.
///
/// Returns the endpoint together with the resulting armed flag, or `None`
/// when the service or characteristic is absent, when discovery fails at the
/// transport level, or when arming fails. Callers treat `None` as a soft
/// degradation: the connection stays up, command sends are rejected until a
/// later resolution succeeds.
///
/// `already_armed` carries the subscription flag for the current connection
/// so updates are armed exactly once per connection lifetime.
pub async fn resolve_and_arm(
    transport: &dyn Transport,
    peripheral: &PeripheralHandle,
    already_armed: bool,
) -> Option<(CommandEndpoint, bool)> {
    match try_resolve(transport, peripheral, already_armed).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!("Command endpoint resolution failed on {peripheral}: {e}");
            None
        }
    }
}

async fn try_resolve(
    transport: &dyn Transport,
    peripheral: &PeripheralHandle,
    already_armed: bool,
) -> Result<Option<(CommandEndpoint, bool)>> {
    let (service_uuid, char_uuid) = command_channel_ids()?;

    let Some(service) = transport.find_service(peripheral, service_uuid).await? else {
        debug!("Command service not present on {peripheral}");
        return Ok(None);
    };

    let Some(characteristic) = transport
        .find_characteristic(peripheral, &service, char_uuid)
        .await?
    else {
        debug!("Command characteristic not present on {peripheral}");
        return Ok(None);
    };

    let endpoint = CommandEndpoint {
        service,
        characteristic,
    };

    let mut armed = already_armed;
    if characteristic.can_notify && !armed {
        transport
            .start_notifications(peripheral, &characteristic)
            .await?;
        armed = true;
        debug!("Notifications armed on {peripheral}");
    }

    Ok(Some((endpoint, armed)))
}

/// Tear down the notification subscription for a dropped connection.
///
/// Errors are swallowed: teardown runs when the link is already gone or
/// going away, so the subscription is moot either way. The caller clears the
/// endpoint cache and subscription flag afterwards.
pub async fn teardown(
    transport: &dyn Transport,
    peripheral: &PeripheralHandle,
    endpoint: CommandEndpoint,
    armed: bool,
) {
    if !armed || !endpoint.characteristic.can_notify {
        return;
    }

    if let Err(e) = transport
        .stop_notifications(peripheral, &endpoint.characteristic)
        .await
    {
        debug!("Ignoring notification teardown error on {peripheral}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn handle() -> PeripheralHandle {
        PeripheralHandle::new(Uuid::new_v4(), "test-device".to_string())
    }

    #[tokio::test]
    async fn test_resolve_success_arms_notifications() {
        let transport = MockTransport::new();
        let peripheral = handle();

        let resolved = resolve_and_arm(&transport, &peripheral, false).await;
        let (endpoint, armed) = resolved.expect("endpoint should resolve");

        assert!(armed);
        assert!(endpoint.characteristic.can_write);
        assert_eq!(
            endpoint.service.uuid,
            Uuid::parse_str(COMMAND_SERVICE_UUID).unwrap()
        );
        assert_eq!(transport.notify_started(), 1);
    }

    #[tokio::test]
    async fn test_already_armed_skips_rearming() {
        let transport = MockTransport::new();
        let peripheral = handle();

        let (_, armed) = resolve_and_arm(&transport, &peripheral, true)
            .await
            .expect("endpoint should resolve");

        assert!(armed);
        assert_eq!(transport.notify_started(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_is_soft_none() {
        let transport = MockTransport::new();
        transport.set_service_present(false);

        assert!(resolve_and_arm(&transport, &handle(), false).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_soft_none() {
        let transport = MockTransport::new();
        transport.set_characteristic_present(false);

        assert!(resolve_and_arm(&transport, &handle(), false).await.is_none());
    }

    #[tokio::test]
    async fn test_arming_failure_degrades_to_none() {
        let transport = MockTransport::new();
        transport.fail_notify_arm(true);

        assert!(resolve_and_arm(&transport, &handle(), false).await.is_none());
    }

    #[tokio::test]
    async fn test_non_notifying_characteristic_resolves_unarmed() {
        let transport = MockTransport::new();
        transport.set_can_notify(false);

        let (endpoint, armed) = resolve_and_arm(&transport, &handle(), false)
            .await
            .expect("endpoint should resolve");

        assert!(!armed);
        assert!(!endpoint.characteristic.can_notify);
        assert_eq!(transport.notify_started(), 0);
    }

    #[tokio::test]
    async fn test_teardown_stops_notifications_once_armed() {
        let transport = MockTransport::new();
        let peripheral = handle();

        let (endpoint, armed) = resolve_and_arm(&transport, &peripheral, false)
            .await
            .expect("endpoint should resolve");

        teardown(&transport, &peripheral, endpoint, armed).await;
        assert_eq!(transport.notify_stopped(), 1);

        // Unarmed teardown never touches the transport.
        teardown(&transport, &peripheral, endpoint, false).await;
        assert_eq!(transport.notify_stopped(), 1);
    }
}
