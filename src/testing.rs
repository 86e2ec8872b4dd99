//! Scripted in-process transport for unit tests

use async_trait::async_trait;
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    stream::{BoxStream, StreamExt},
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use uuid::Uuid;

use crate::{
    ble::{Link, LinkEvent, Transport},
    error::{BandError, Result},
    types::{DeviceClass, DeviceInfo, DiscoveryFilter, ServiceInfo},
};

/// Services a well-behaved band of the class exposes
pub fn services_for(class: DeviceClass) -> Vec<ServiceInfo> {
    let mut characteristics = vec![class.read_characteristic()];
    characteristics.extend(class.command_characteristic());
    vec![
        ServiceInfo::new(class.service_uuid(), characteristics),
        ServiceInfo::battery(),
    ]
}

pub struct MockLink {
    id: String,
    services: Vec<ServiceInfo>,
    battery: u8,
    sender: UnboundedSender<LinkEvent>,
    receiver: Mutex<Option<UnboundedReceiver<LinkEvent>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    subscribed: Mutex<Vec<Uuid>>,
    fail_writes: AtomicBool,
    fail_disconnect: AtomicBool,
    disconnected: AtomicBool,
}

impl MockLink {
    pub fn new(id: &str, services: Vec<ServiceInfo>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            id: id.to_string(),
            services,
            battery: 87,
            sender,
            receiver: Mutex::new(Some(receiver)),
            writes: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Push a notification as if the device sent it
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        let _ = self.sender.unbounded_send(LinkEvent::Notification {
            characteristic,
            value: value.to_vec(),
        });
    }

    /// Drop the link as if the device went out of range
    pub fn drop_link(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        let _ = self.sender.unbounded_send(LinkEvent::Disconnected);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<Uuid> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.services.clone())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        self.subscribed.lock().unwrap().push(characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        self.subscribed.lock().unwrap().retain(|c| *c != characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        if characteristic == crate::BATTERY_LEVEL_CHAR_UUID {
            Ok(vec![self.battery])
        } else {
            Err(BandError::CharacteristicNotFound(characteristic))
        }
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BandError::WriteFailed("mock write rejected".into()));
        }
        self.writes
            .lock()
            .unwrap()
            .push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BandError::UnexpectedDisconnect("events already taken".into()))?;
        Ok(receiver.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BandError::UnexpectedDisconnect("mock disconnect failed".into()));
        }
        Ok(())
    }
}

/// Transport whose discovery and connect steps are scripted by the test
pub struct MockTransport {
    class: DeviceClass,
    services: Mutex<Vec<ServiceInfo>>,
    discover_delay: Duration,
    open_delay: Duration,
    discover_error: Mutex<Option<BandError>>,
    /// Open calls from this index on fail
    fail_opens_from: Mutex<Option<usize>>,
    discover_calls: AtomicUsize,
    open_calls: AtomicUsize,
    filters: Mutex<Vec<DiscoveryFilter>>,
    links: Mutex<VecDeque<Arc<MockLink>>>,
}

impl MockTransport {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            services: Mutex::new(services_for(class)),
            discover_delay: Duration::ZERO,
            open_delay: Duration::ZERO,
            discover_error: Mutex::new(None),
            fail_opens_from: Mutex::new(None),
            discover_calls: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            filters: Mutex::new(Vec::new()),
            links: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_discover_delay(mut self, delay: Duration) -> Self {
        self.discover_delay = delay;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_services(self, services: Vec<ServiceInfo>) -> Self {
        *self.services.lock().unwrap() = services;
        self
    }

    pub fn with_discover_error(self, error: BandError) -> Self {
        *self.discover_error.lock().unwrap() = Some(error);
        self
    }

    pub fn fail_opens_from(&self, index: usize) {
        *self.fail_opens_from.lock().unwrap() = Some(index);
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Links that finished opening
    pub fn opened_links(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn filters(&self) -> Vec<DiscoveryFilter> {
        self.filters.lock().unwrap().clone()
    }

    /// Most recently opened link
    pub fn last_link(&self) -> Arc<MockLink> {
        Arc::clone(
            self.links
                .lock()
                .unwrap()
                .back()
                .expect("no link has been opened"),
        )
    }

    fn device_id(&self) -> String {
        match self.class {
            DeviceClass::HeartRate => "hr-band-01".to_string(),
            DeviceClass::Breathing => "sync-band-01".to_string(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn discover(
        &self,
        filter: &DiscoveryFilter,
        _scan_timeout: Duration,
    ) -> Result<DeviceInfo> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        self.filters.lock().unwrap().push(filter.clone());
        tokio::time::sleep(self.discover_delay).await;

        if let Some(error) = self.discover_error.lock().unwrap().clone() {
            return Err(error);
        }

        let id = filter
            .known_ids
            .first()
            .cloned()
            .unwrap_or_else(|| self.device_id());
        Ok(DeviceInfo {
            id,
            name: Some("Mock Band".to_string()),
            rssi: Some(-48),
        })
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn Link>> {
        let index = self.open_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;

        let failing = self
            .fail_opens_from
            .lock()
            .unwrap()
            .is_some_and(|from| index >= from);
        if failing {
            return Err(BandError::UnexpectedDisconnect(format!(
                "{device_id} out of range"
            )));
        }

        let services = self.services.lock().unwrap().clone();
        let link = Arc::new(MockLink::new(device_id, services));
        self.links.lock().unwrap().push_back(Arc::clone(&link));
        Ok(link)
    }
}
