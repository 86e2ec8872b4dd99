use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    ble::Transport,
    error::{BandError, Result},
    manager::ConnectionManager,
    types::{
        BandEvent, ConnectionParams, DeviceClass, DiscoveryFilter, ReconnectConfig,
        SessionSnapshot,
    },
};

/// Persistence for last-known device ids, keyed by device class
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Stored ids for a class, most recent first
    async fn load(&self, class: DeviceClass) -> Result<Vec<String>>;

    /// Replace the stored ids for a class
    async fn save(&self, class: DeviceClass, ids: Vec<String>) -> Result<()>;
}

/// In-memory [`DeviceStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    ids: RwLock<HashMap<DeviceClass, Vec<String>>>,
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load(&self, class: DeviceClass) -> Result<Vec<String>> {
        Ok(self.ids.read().await.get(&class).cloned().unwrap_or_default())
    }

    async fn save(&self, class: DeviceClass, ids: Vec<String>) -> Result<()> {
        self.ids.write().await.insert(class, ids);
        Ok(())
    }
}

/// Owns at most one live connection manager per device class
///
/// All managers share one observer channel; subscribe once to see state
/// changes, samples, and errors from every band.
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    store: Arc<dyn DeviceStore>,
    params: ConnectionParams,
    reconnect: ReconnectConfig,
    events: broadcast::Sender<BandEvent>,
    managers: Mutex<HashMap<DeviceClass, ConnectionManager>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("params", &self.params)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create a registry with default connection and reconnect settings
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn DeviceStore>) -> Self {
        Self::with_config(
            transport,
            store,
            ConnectionParams::default(),
            ReconnectConfig::default(),
        )
    }

    /// Create a registry with custom settings
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn Transport>,
        store: Arc<dyn DeviceStore>,
        params: ConnectionParams,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(params.event_capacity.max(1));
        Self {
            transport,
            store,
            params,
            reconnect,
            events,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Receive events from every manager
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BandEvent> {
        self.events.subscribe()
    }

    /// Live manager for a class, started on first use
    ///
    /// A manager that has shut down is replaced.
    pub async fn get_or_create(&self, class: DeviceClass) -> ConnectionManager {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(&class) {
            if !manager.is_closed() {
                return manager.clone();
            }
            debug!("Replacing stopped {} manager", class);
        }

        let manager = ConnectionManager::spawn(
            class,
            Arc::clone(&self.transport),
            self.params.clone(),
            self.reconnect.clone(),
            self.events.clone(),
        );
        managers.insert(class, manager.clone());
        manager
    }

    async fn existing(&self, class: DeviceClass) -> Option<ConnectionManager> {
        self.managers.lock().await.get(&class).cloned()
    }

    /// Connect a device class through its manager
    ///
    /// On success the device id is remembered as the most recent one for
    /// the class. A failing store is logged and does not fail the connect.
    ///
    /// # Errors
    ///
    /// Returns the connect error from [`ConnectionManager::connect`].
    pub async fn connect(
        &self,
        class: DeviceClass,
        filter: DiscoveryFilter,
    ) -> Result<SessionSnapshot> {
        let manager = self.get_or_create(class).await;
        let snapshot = manager.connect(filter).await?;

        if let Some(id) = &snapshot.device_id {
            if let Err(e) = self.persist_last_known(class, id).await {
                warn!("Could not remember {} {}: {}", class, id, e);
            }
        }
        Ok(snapshot)
    }

    /// Connect with the default filter of the class
    ///
    /// # Errors
    ///
    /// See [`SessionRegistry::connect`].
    pub async fn connect_default(&self, class: DeviceClass) -> Result<SessionSnapshot> {
        self.connect(class, class.default_filter()).await
    }

    /// Connect, preferring devices this class was connected to before
    ///
    /// # Errors
    ///
    /// See [`SessionRegistry::connect`].
    pub async fn connect_last_known(&self, class: DeviceClass) -> Result<SessionSnapshot> {
        let known = self.load_last_known(class).await.unwrap_or_else(|e| {
            warn!("Could not load known {} devices: {}", class, e);
            Vec::new()
        });
        info!("Reconnecting {} with {} known devices", class, known.len());

        self.connect(class, class.default_filter().with_known_ids(known))
            .await
    }

    /// Disconnect a device class
    ///
    /// Returns the release warning, if any. A class that was never started
    /// has nothing to disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::ManagerClosed`] if the manager stopped meanwhile.
    pub async fn disconnect(&self, class: DeviceClass) -> Result<Option<BandError>> {
        match self.existing(class).await {
            Some(manager) => manager.disconnect().await,
            None => Ok(None),
        }
    }

    /// Forward the host-became-active signal to every manager
    pub async fn notify_foreground(&self) {
        let managers: Vec<_> = self.managers.lock().await.values().cloned().collect();
        for manager in managers {
            if let Err(e) = manager.notify_foreground().await {
                debug!("Skipping {} manager: {}", manager.class(), e);
            }
        }
    }

    /// Stop the manager of a class and drop everything known about it
    ///
    /// # Errors
    ///
    /// Returns [`BandError::Storage`] if the stored ids cannot be cleared.
    pub async fn forget(&self, class: DeviceClass) -> Result<()> {
        let removed = self.managers.lock().await.remove(&class);
        if let Some(manager) = removed {
            manager.shutdown().await;
        }
        info!("Forgot {}", class);
        self.store.save(class, Vec::new()).await
    }

    /// Current snapshot of a class, idle if it has no manager
    pub async fn snapshot(&self, class: DeviceClass) -> SessionSnapshot {
        match self.existing(class).await {
            Some(manager) => manager.snapshot(),
            None => SessionSnapshot::idle(class),
        }
    }

    /// Remember a device id as the most recent for its class
    ///
    /// # Errors
    ///
    /// Returns [`BandError::Storage`] from the store.
    pub async fn persist_last_known(&self, class: DeviceClass, id: &str) -> Result<()> {
        let mut ids = self.store.load(class).await?;
        ids.retain(|known| known != id);
        ids.insert(0, id.to_string());
        ids.truncate(self.params.last_known_limit);

        debug!("Known {} devices: {:?}", class, ids);
        self.store.save(class, ids).await
    }

    /// Device ids remembered for a class, most recent first
    ///
    /// # Errors
    ///
    /// Returns [`BandError::Storage`] from the store.
    pub async fn load_last_known(&self, class: DeviceClass) -> Result<Vec<String>> {
        self.store.load(class).await
    }

    /// Stop every manager
    pub async fn shutdown(&self) {
        let managers: Vec<_> = self.managers.lock().await.drain().collect();
        for (class, manager) in managers {
            debug!("Stopping {} manager", class);
            manager.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::MockTransport, types::ConnectionState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    struct FailingStore {
        failing: AtomicBool,
    }

    #[async_trait]
    impl DeviceStore for FailingStore {
        async fn load(&self, _class: DeviceClass) -> Result<Vec<String>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BandError::Storage("disk full".into()));
            }
            Ok(Vec::new())
        }

        async fn save(&self, _class: DeviceClass, _ids: Vec<String>) -> Result<()> {
            Err(BandError::Storage("disk full".into()))
        }
    }

    fn registry(transport: &Arc<MockTransport>) -> SessionRegistry {
        SessionRegistry::new(transport.clone(), Arc::new(MemoryStore::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_manager_per_class() {
        let transport = Arc::new(MockTransport::new(DeviceClass::HeartRate));
        let registry = registry(&transport);

        let a = registry.get_or_create(DeviceClass::HeartRate).await;
        let b = registry.get_or_create(DeviceClass::HeartRate).await;
        let c = registry.get_or_create(DeviceClass::Breathing).await;

        assert!(a.same_channel(&b));
        assert!(!a.same_channel(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_manager_is_replaced() {
        let transport = Arc::new(MockTransport::new(DeviceClass::HeartRate));
        let registry = registry(&transport);

        let first = registry.get_or_create(DeviceClass::HeartRate).await;
        first.shutdown().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = registry.get_or_create(DeviceClass::HeartRate).await;
        assert!(!second.same_channel(&first));
        assert!(!second.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_remembers_device() {
        let transport = Arc::new(MockTransport::new(DeviceClass::HeartRate));
        let registry = registry(&transport);
        let mut events = registry.subscribe();

        let snapshot = assert_ok!(registry.connect_default(DeviceClass::HeartRate).await);
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(
            assert_ok!(registry.load_last_known(DeviceClass::HeartRate).await),
            vec!["hr-band-01".to_string()]
        );
        assert_eq!(
            registry.snapshot(DeviceClass::HeartRate).await.state,
            ConnectionState::Connected
        );
        assert!(matches!(
            events.try_recv(),
            Ok(BandEvent::StateChanged(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_known_is_ordered_and_bounded() {
        let transport = Arc::new(MockTransport::new(DeviceClass::Breathing));
        let registry = SessionRegistry::with_config(
            transport,
            Arc::new(MemoryStore::default()),
            ConnectionParams {
                last_known_limit: 3,
                ..ConnectionParams::default()
            },
            ReconnectConfig::default(),
        );

        for id in ["a", "b", "c", "a", "d"] {
            assert_ok!(registry.persist_last_known(DeviceClass::Breathing, id).await);
        }

        assert_eq!(
            assert_ok!(registry.load_last_known(DeviceClass::Breathing).await),
            vec!["d".to_string(), "a".to_string(), "c".to_string()]
        );
        assert!(assert_ok!(registry.load_last_known(DeviceClass::HeartRate).await).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_last_known_prefers_stored_ids() {
        let transport = Arc::new(MockTransport::new(DeviceClass::Breathing));
        let registry = registry(&transport);
        assert_ok!(registry.persist_last_known(DeviceClass::Breathing, "sync-old").await);
        assert_ok!(registry.persist_last_known(DeviceClass::Breathing, "sync-new").await);

        let snapshot = assert_ok!(registry.connect_last_known(DeviceClass::Breathing).await);
        assert_eq!(snapshot.device_id.as_deref(), Some("sync-new"));

        let filter = &transport.filters()[0];
        assert_eq!(filter.known_ids, vec!["sync-new", "sync-old"]);
        assert_eq!(filter.name_prefix.as_deref(), Some("SYNC"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_does_not_fail_connect() {
        let transport = Arc::new(MockTransport::new(DeviceClass::HeartRate));
        let registry = SessionRegistry::new(
            transport.clone(),
            Arc::new(FailingStore {
                failing: AtomicBool::new(true),
            }),
        );

        assert_ok!(registry.connect_last_known(DeviceClass::HeartRate).await);
        assert!(transport.filters()[0].known_ids.is_empty());

        let err = assert_err!(registry.forget(DeviceClass::HeartRate).await);
        assert!(matches!(err, BandError::Storage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_clears_class() {
        let transport = Arc::new(MockTransport::new(DeviceClass::HeartRate));
        let registry = registry(&transport);
        let manager = registry.get_or_create(DeviceClass::HeartRate).await;
        assert_ok!(registry.connect_default(DeviceClass::HeartRate).await);

        assert_ok!(registry.forget(DeviceClass::HeartRate).await);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(manager.is_closed());
        assert!(transport.last_link().is_disconnected());
        assert!(assert_ok!(registry.load_last_known(DeviceClass::HeartRate).await).is_empty());
        assert_eq!(
            registry.snapshot(DeviceClass::HeartRate).await.state,
            ConnectionState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_unknown_class_is_noop() {
        let transport = Arc::new(MockTransport::new(DeviceClass::HeartRate));
        let registry = registry(&transport);

        assert_eq!(
            assert_ok!(registry.disconnect(DeviceClass::Breathing).await),
            None
        );
        registry.notify_foreground().await;
        registry.shutdown().await;
    }
}
