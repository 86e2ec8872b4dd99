use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{self, BoxStream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BandError, Result},
    types::{DeviceInfo, DiscoveryFilter, ServiceInfo},
};

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A characteristic pushed a value
    Notification {
        /// Characteristic the value came from
        characteristic: Uuid,
        /// Raw payload
        value: Vec<u8>,
    },
    /// The transport reported the link gone
    Disconnected,
}

/// Device discovery and GATT connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Find one device matching the filter
    ///
    /// Devices listed in `filter.known_ids` are preferred when the platform
    /// still knows them, without starting a scan.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::DeviceSelectionCancelled`] when no device was
    /// selected within `scan_timeout`, or [`BandError::BluetoothUnavailable`]
    /// when the adapter cannot scan.
    async fn discover(&self, filter: &DiscoveryFilter, scan_timeout: Duration)
        -> Result<DeviceInfo>;

    /// Open a GATT connection to a previously discovered device
    ///
    /// # Errors
    ///
    /// Returns a translated transport error if the connection cannot be opened.
    async fn open(&self, device_id: &str) -> Result<Arc<dyn Link>>;
}

/// An open GATT connection
#[async_trait]
pub trait Link: Send + Sync {
    /// Platform identifier of the connected device
    fn id(&self) -> &str;

    /// List services and their characteristics
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>>;

    /// Enable notifications on a characteristic
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications on a characteristic
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Stream of notifications and the disconnect event
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;
}

fn adapter_error(err: &btleplug::Error) -> BandError {
    BandError::BluetoothUnavailable(err.to_string())
}

/// btleplug-backed transport using the first Bluetooth adapter
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the first available Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`BandError::BluetoothUnavailable`] if no adapter can be used.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| adapter_error(&e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| adapter_error(&e))?
            .into_iter()
            .next()
            .ok_or_else(|| BandError::BluetoothUnavailable("No Bluetooth adapter found".into()))?;

        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Option<Peripheral>> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| adapter_error(&e))?;
        Ok(peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device_id))
    }

    /// Check advertised properties against the filter
    ///
    /// A device identified by name may omit its service from the
    /// advertisement, so a matching name prefix stands in for the service.
    async fn matches(peripheral: &Peripheral, filter: &DiscoveryFilter) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok()??;
        let name = properties.local_name.as_deref();

        if !filter.accepts_name(name) {
            return None;
        }

        let service_match = filter.services.is_empty()
            || filter
                .services
                .iter()
                .any(|s| properties.services.contains(s));
        if !service_match && filter.name_prefix.is_none() {
            return None;
        }

        Some(DeviceInfo {
            id: peripheral.id().to_string(),
            name: properties.local_name.clone(),
            rssi: properties.rssi,
        })
    }

    async fn scan(&self, filter: &DiscoveryFilter) -> Result<DeviceInfo> {
        // Subscribe first so a device found while listing is not missed
        let mut events = self.adapter.events().await.map_err(|e| adapter_error(&e))?;

        for peripheral in self
            .adapter
            .peripherals()
            .await
            .map_err(|e| adapter_error(&e))?
        {
            if let Some(info) = Self::matches(&peripheral, filter).await {
                return Ok(info);
            }
        }

        while let Some(event) = events.next().await {
            let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
            else {
                continue;
            };
            if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                if let Some(info) = Self::matches(&peripheral, filter).await {
                    return Ok(info);
                }
            }
        }

        Err(BandError::DeviceSelectionCancelled)
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn discover(
        &self,
        filter: &DiscoveryFilter,
        scan_timeout: Duration,
    ) -> Result<DeviceInfo> {
        for id in &filter.known_ids {
            if let Some(peripheral) = self.find_peripheral(id).await? {
                let properties = peripheral.properties().await.ok().flatten();
                info!("Reusing known device {id}");
                return Ok(DeviceInfo {
                    id: id.clone(),
                    name: properties.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: properties.and_then(|p| p.rssi),
                });
            }
        }

        // Name-identified devices may not advertise their service
        let scan_filter = if filter.name_prefix.is_some() {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: filter.services.clone(),
            }
        };

        info!("Starting scan for {:?}", filter.services);
        self.adapter
            .start_scan(scan_filter)
            .await
            .map_err(|e| adapter_error(&e))?;

        let selected = timeout(scan_timeout, self.scan(filter)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }

        match selected {
            Ok(result) => result,
            Err(_) => {
                info!("Scan window elapsed without a matching device");
                Err(BandError::DeviceSelectionCancelled)
            }
        }
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn Link>> {
        let peripheral = self.find_peripheral(device_id).await?.ok_or_else(|| {
            BandError::UnexpectedDisconnect(format!("Device {device_id} is no longer known"))
        })?;

        info!("Connecting to device {device_id}");
        peripheral.connect().await?;

        Ok(Arc::new(BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral,
            id: device_id.to_string(),
        }))
    }
}

/// Open connection to a btleplug peripheral
pub struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    id: String,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BandError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl Link for BtleplugLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        self.peripheral.discover_services().await?;

        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|s| ServiceInfo {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect::<Vec<_>>();
        debug!("Device {} exposes {} services", self.id, services.len());

        Ok(services)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self
            .characteristic(characteristic)
            .map_err(|e| BandError::WriteFailed(e.to_string()))?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        debug!("Writing {:02X?} to {}", data, characteristic.uuid);
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| BandError::WriteFailed(e.to_string()))
    }

    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let notifications = self
            .peripheral
            .notifications()
            .await?
            .map(|n| LinkEvent::Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            // the notification stream ends when the peripheral goes away
            .chain(stream::once(async { LinkEvent::Disconnected }));

        let peripheral_id = self.peripheral.id();
        let disconnects = self
            .adapter
            .events()
            .await
            .map_err(|e| adapter_error(&e))?
            .filter_map(move |event| {
                let lost = matches!(&event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id);
                async move { lost.then_some(LinkEvent::Disconnected) }
            });

        Ok(stream::select(notifications, disconnects).boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
