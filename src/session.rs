use futures::stream::BoxStream;
use std::{future::Future, sync::Arc, time::SystemTime};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    ble::{Link, LinkEvent},
    error::{BandError, Result},
    protocol::{self, Command},
    types::{DeviceClass, SampleEvent, ServiceInfo},
    BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID,
};

/// One open connection with its characteristics resolved
///
/// Owned by exactly one connection manager. Sample frames arriving on the
/// read characteristic are decoded here, one sample per frame.
pub struct DeviceSession {
    class: DeviceClass,
    link: Arc<dyn Link>,
    read_characteristic: Uuid,
    command_characteristic: Option<Uuid>,
    battery_characteristic: Option<Uuid>,
    last_seen: SystemTime,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.link.id())
            .field("class", &self.class)
            .field("read_characteristic", &self.read_characteristic)
            .field("command_characteristic", &self.command_characteristic)
            .field("battery_characteristic", &self.battery_characteristic)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

fn has_characteristic(service: &ServiceInfo, uuid: Uuid) -> Result<Uuid> {
    if service.characteristics.contains(&uuid) {
        Ok(uuid)
    } else {
        Err(BandError::CharacteristicNotFound(uuid))
    }
}

impl DeviceSession {
    /// Look up the services and characteristics a device class needs
    ///
    /// # Errors
    ///
    /// Returns [`BandError::ServiceNotFound`] or
    /// [`BandError::CharacteristicNotFound`] if the device is not the
    /// expected kind, or a translated transport error.
    pub async fn resolve(class: DeviceClass, link: Arc<dyn Link>) -> Result<Self> {
        let services = link.discover_services().await?;

        let service = services
            .iter()
            .find(|s| s.uuid == class.service_uuid())
            .ok_or_else(|| BandError::ServiceNotFound(class.service_uuid()))?;

        let read_characteristic = has_characteristic(service, class.read_characteristic())?;
        let command_characteristic = class
            .command_characteristic()
            .map(|uuid| has_characteristic(service, uuid))
            .transpose()?;

        let battery_characteristic = services
            .iter()
            .find(|s| s.uuid == BATTERY_SERVICE_UUID)
            .and_then(|s| has_characteristic(s, BATTERY_LEVEL_CHAR_UUID).ok());

        info!(
            "Resolved {} on {} (battery: {})",
            class,
            link.id(),
            battery_characteristic.is_some()
        );

        Ok(Self {
            class,
            link,
            read_characteristic,
            command_characteristic,
            battery_characteristic,
            last_seen: SystemTime::now(),
        })
    }

    /// Platform identifier of the device
    #[must_use]
    pub fn id(&self) -> &str {
        self.link.id()
    }

    /// Device class of the session
    #[must_use]
    pub const fn class(&self) -> DeviceClass {
        self.class
    }

    /// Time of the last decoded frame, or of resolution
    #[must_use]
    pub const fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    /// Subscribe to the read characteristic and return the event stream
    ///
    /// The stream is opened before subscribing so no early frame is lost.
    ///
    /// # Errors
    ///
    /// Returns a translated transport error if notifications cannot start.
    pub async fn start_notifications(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let events = self.link.events().await?;
        self.link.subscribe(self.read_characteristic).await?;
        debug!("Notifications started on {}", self.read_characteristic);
        Ok(events)
    }

    /// Unsubscribe from the read characteristic
    ///
    /// # Errors
    ///
    /// Returns a translated transport error if the unsubscribe fails.
    pub async fn stop_notifications(&self) -> Result<()> {
        self.link.unsubscribe(self.read_characteristic).await
    }

    /// Decode a notification into a timestamped sample
    ///
    /// Returns `None` for values from other characteristics.
    pub fn handle_frame(&mut self, characteristic: Uuid, value: &[u8]) -> Option<Result<SampleEvent>> {
        if characteristic != self.read_characteristic {
            return None;
        }

        let decoded = protocol::decode(self.class, value).map(|sample| {
            let timestamp = SystemTime::now();
            self.last_seen = timestamp;
            SampleEvent {
                class: self.class,
                sample,
                timestamp,
            }
        });
        Some(decoded)
    }

    /// Write a command frame
    ///
    /// The returned future does not borrow the session, so the caller may
    /// run it elsewhere while the session keeps handling frames.
    pub fn write_command(&self, command: Command) -> impl Future<Output = Result<()>> + Send + 'static {
        let link = Arc::clone(&self.link);
        let target = self.command_characteristic;
        let class = self.class;

        async move {
            let characteristic = target.ok_or_else(|| {
                BandError::WriteFailed(format!("The {class} has no command characteristic"))
            })?;
            let frame = command.to_bytes();
            link.write(characteristic, &frame)
                .await
                .map_err(|e| match e {
                    BandError::WriteFailed(_) => e,
                    other => BandError::WriteFailed(other.to_string()),
                })
        }
    }

    /// Read the battery level in percent
    ///
    /// # Errors
    ///
    /// The returned future fails with [`BandError::ServiceNotFound`] when the
    /// device has no battery service, or with the decode/transport error.
    pub fn read_battery(&self) -> impl Future<Output = Result<u8>> + Send + 'static {
        let link = Arc::clone(&self.link);
        let target = self.battery_characteristic;

        async move {
            let characteristic = target.ok_or(BandError::ServiceNotFound(BATTERY_SERVICE_UUID))?;
            let value = link.read(characteristic).await?;
            protocol::decode_battery_level(&value)
        }
    }

    /// Stop notifications and close the link
    ///
    /// Both steps are attempted; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first transport error encountered.
    pub async fn release(self) -> Result<()> {
        let unsubscribed = self.stop_notifications().await;
        let disconnected = self.link.disconnect().await;
        info!("Released {} {}", self.class, self.link.id());
        unsubscribed.and(disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::MockLink,
        types::{HeartRateSample, Sample},
        BREATHING_COMMAND_CHAR_UUID, BREATHING_SERVICE_UUID, BREATHING_TELEMETRY_CHAR_UUID,
        HEART_RATE_MEASUREMENT_CHAR_UUID,
    };
    use tokio_test::{assert_err, assert_ok};

    fn link(services: Vec<ServiceInfo>) -> Arc<MockLink> {
        Arc::new(MockLink::new("band-1", services))
    }

    #[tokio::test]
    async fn test_resolve_breathing_session() {
        let mock = link(crate::testing::services_for(DeviceClass::Breathing));
        let session = assert_ok!(DeviceSession::resolve(DeviceClass::Breathing, mock).await);

        assert_eq!(session.id(), "band-1");
        assert_eq!(session.read_characteristic, BREATHING_TELEMETRY_CHAR_UUID);
        assert_eq!(
            session.command_characteristic,
            Some(BREATHING_COMMAND_CHAR_UUID)
        );
        assert_eq!(session.battery_characteristic, Some(BATTERY_LEVEL_CHAR_UUID));
    }

    #[tokio::test]
    async fn test_resolve_missing_service() {
        let mock = link(vec![ServiceInfo::battery()]);
        let err = assert_err!(DeviceSession::resolve(DeviceClass::HeartRate, mock).await);
        assert_eq!(
            err,
            BandError::ServiceNotFound(DeviceClass::HeartRate.service_uuid())
        );
    }

    #[tokio::test]
    async fn test_resolve_missing_command_characteristic() {
        let mock = link(vec![ServiceInfo::new(
            BREATHING_SERVICE_UUID,
            vec![BREATHING_TELEMETRY_CHAR_UUID],
        )]);
        let err = assert_err!(DeviceSession::resolve(DeviceClass::Breathing, mock).await);
        assert_eq!(
            err,
            BandError::CharacteristicNotFound(BREATHING_COMMAND_CHAR_UUID)
        );
    }

    #[tokio::test]
    async fn test_handle_frame() {
        let mock = link(crate::testing::services_for(DeviceClass::HeartRate));
        let mut session = assert_ok!(DeviceSession::resolve(DeviceClass::HeartRate, mock).await);

        let event = session
            .handle_frame(HEART_RATE_MEASUREMENT_CHAR_UUID, &[0x00, 71])
            .unwrap()
            .unwrap();
        assert_eq!(event.sample, Sample::HeartRate(HeartRateSample { bpm: 71 }));
        assert_eq!(event.timestamp, session.last_seen());

        assert!(session
            .handle_frame(HEART_RATE_MEASUREMENT_CHAR_UUID, &[0x01])
            .unwrap()
            .is_err());
        assert!(session
            .handle_frame(BATTERY_LEVEL_CHAR_UUID, &[0x00, 71])
            .is_none());
    }

    #[tokio::test]
    async fn test_heart_rate_has_no_command_characteristic() {
        let mock = link(crate::testing::services_for(DeviceClass::HeartRate));
        let session = assert_ok!(DeviceSession::resolve(DeviceClass::HeartRate, mock.clone()).await);

        let err = assert_err!(session.write_command(Command::start_training()).await);
        assert!(matches!(err, BandError::WriteFailed(_)));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_release_reports_first_error() {
        let mock = link(crate::testing::services_for(DeviceClass::Breathing));
        let session = assert_ok!(DeviceSession::resolve(DeviceClass::Breathing, mock.clone()).await);
        mock.fail_disconnect();

        assert_err!(session.release().await);
        assert!(mock.is_disconnected());
    }
}
