use futures::{
    future::{BoxFuture, FutureExt},
    stream::{BoxStream, StreamExt},
};
use std::{collections::HashMap, sync::Arc, time::SystemTime};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::{Link, LinkEvent, Transport},
    error::{BandError, Result},
    protocol::Command,
    reconnect::{ReconnectAttemptRecord, ReconnectDecision, ReconnectPolicy},
    session::DeviceSession,
    types::{
        BandEvent, ConnectionParams, ConnectionState, DeviceClass, DeviceInfo, DisconnectReason,
        DiscoveryFilter, ReconnectConfig, SessionSnapshot, StateChange, TransitionReason,
    },
};

const INBOX_CAPACITY: usize = 32;

enum ManagerCommand {
    Connect(DiscoveryFilter, oneshot::Sender<Result<SessionSnapshot>>),
    Disconnect(oneshot::Sender<Option<BandError>>),
    Foreground,
    SendCommand(Command, oneshot::Sender<Result<()>>),
    ReadBattery(oneshot::Sender<Result<u8>>),
    Shutdown(oneshot::Sender<()>),
}

/// Completion of the in-flight connect step
enum Step {
    Discovered(Result<DeviceInfo>),
    Opened(Result<Arc<dyn Link>>),
    Resolved(Result<(DeviceSession, BoxStream<'static, LinkEvent>)>),
}

/// Handle to the connection state machine of one device class
///
/// The state machine runs as its own task and owns the device session. All
/// operations are messages to that task, so handles are cheap to clone and
/// safe to use from anywhere. The current [`SessionSnapshot`] is mirrored into
/// a watch channel and can be read without a round trip.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
/// use bandlink::{
///     BtleplugTransport, ConnectionManager, ConnectionParams, DeviceClass, ReconnectConfig,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(BtleplugTransport::new().await?);
///     let (events, _) = broadcast::channel(256);
///     let manager = ConnectionManager::spawn(
///         DeviceClass::Breathing,
///         transport,
///         ConnectionParams::default(),
///         ReconnectConfig::default(),
///         events,
///     );
///
///     manager.connect(DeviceClass::Breathing.default_filter()).await?;
///     manager.start_training().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    class: DeviceClass,
    inbox: mpsc::Sender<ManagerCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("class", &self.class)
            .field("state", &self.snapshot.borrow().state)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Start the state machine task for a device class
    ///
    /// Must be called from within a tokio runtime. Observer events are
    /// published on `events`.
    #[must_use]
    pub fn spawn(
        class: DeviceClass,
        transport: Arc<dyn Transport>,
        params: ConnectionParams,
        reconnect: ReconnectConfig,
        events: broadcast::Sender<BandEvent>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle(class));

        let actor = ManagerActor {
            class,
            transport,
            params,
            policy: ReconnectPolicy::new(reconnect),
            inbox: inbox_rx,
            snapshot: snapshot_tx,
            events,
            state: ConnectionState::Idle,
            device_id: None,
            last_seen: SystemTime::now(),
            waiters: Vec::new(),
            pending: None,
            opening: None,
            session: None,
            link_events: None,
            retry_at: None,
            attempts: HashMap::new(),
        };
        tokio::spawn(actor.run());

        Self {
            class,
            inbox: inbox_tx,
            snapshot: snapshot_rx,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(make(tx))
            .await
            .map_err(|_| BandError::ManagerClosed)?;
        rx.await.map_err(|_| BandError::ManagerClosed)
    }

    /// Connect to a device matching the filter
    ///
    /// Concurrent calls share one connect sequence and all receive its
    /// outcome. If a device is already connected, or a lost link is being
    /// recovered, the current snapshot is returned without starting anything.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connect sequence, such as
    /// [`BandError::ConnectionTimeout`] or [`BandError::ServiceNotFound`], or
    /// [`BandError::DeviceSelectionCancelled`] if a disconnect cancelled it.
    pub async fn connect(&self, filter: DiscoveryFilter) -> Result<SessionSnapshot> {
        self.request(|reply| ManagerCommand::Connect(filter, reply))
            .await?
    }

    /// Disconnect, or cancel a connect in progress
    ///
    /// Always leaves the manager idle. A transport error raised while
    /// releasing the link is returned as a warning, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::ManagerClosed`] if the manager has shut down.
    pub async fn disconnect(&self) -> Result<Option<BandError>> {
        self.request(ManagerCommand::Disconnect).await
    }

    /// Tell the manager the host application became active
    ///
    /// A pending reconnect is retried at once, ignoring any backoff delay.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::ManagerClosed`] if the manager has shut down.
    pub async fn notify_foreground(&self) -> Result<()> {
        self.inbox
            .send(ManagerCommand::Foreground)
            .await
            .map_err(|_| BandError::ManagerClosed)
    }

    /// Write a command frame to the connected device
    ///
    /// # Errors
    ///
    /// Returns [`BandError::WriteFailed`] if no device is connected, the
    /// device class takes no commands, or the write fails.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.request(|reply| ManagerCommand::SendCommand(command, reply))
            .await?
    }

    /// Start the motor in breathing-training mode
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::send_command`].
    pub async fn start_training(&self) -> Result<()> {
        self.send_command(Command::start_training()).await
    }

    /// Stop the motor
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::send_command`].
    pub async fn stop_training(&self) -> Result<()> {
        self.send_command(Command::stop_training()).await
    }

    /// Read the battery level of the connected device in percent
    ///
    /// # Errors
    ///
    /// Returns [`BandError::NotConnected`] without a connected device, or
    /// [`BandError::ServiceNotFound`] if the device has no battery service.
    pub async fn read_battery(&self) -> Result<u8> {
        self.request(ManagerCommand::ReadBattery).await?
    }

    /// Current state of the session
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every snapshot update
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Device class this manager serves
    #[must_use]
    pub const fn class(&self) -> DeviceClass {
        self.class
    }

    /// Check if the manager task has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Check if two handles talk to the same manager task
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        self.inbox.same_channel(&other.inbox)
    }

    /// Release any connection and stop the manager task
    ///
    /// Stopping an already stopped manager does nothing.
    pub async fn shutdown(&self) {
        if self.request(ManagerCommand::Shutdown).await.is_err() {
            debug!("{} manager already stopped", self.class);
        }
    }
}

struct ManagerActor {
    class: DeviceClass,
    transport: Arc<dyn Transport>,
    params: ConnectionParams,
    policy: ReconnectPolicy,
    inbox: mpsc::Receiver<ManagerCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<BandEvent>,

    state: ConnectionState,
    device_id: Option<String>,
    last_seen: SystemTime,
    /// Callers attached to the connect sequence in flight
    waiters: Vec<oneshot::Sender<Result<SessionSnapshot>>>,
    pending: Option<BoxFuture<'static, Step>>,
    /// Link opened but not yet resolved into a session
    opening: Option<Arc<dyn Link>>,
    session: Option<DeviceSession>,
    link_events: Option<BoxStream<'static, LinkEvent>>,
    retry_at: Option<Instant>,
    attempts: HashMap<String, ReconnectAttemptRecord>,
}

async fn next_step(pending: &mut Option<BoxFuture<'static, Step>>) -> Step {
    match pending.as_mut() {
        Some(step) => {
            let step = step.await;
            *pending = None;
            step
        }
        None => std::future::pending().await,
    }
}

async fn next_link_event(events: &mut Option<BoxStream<'static, LinkEvent>>) -> Option<LinkEvent> {
    match events.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ManagerActor {
    async fn run(mut self) {
        debug!("{} manager started", self.class);

        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        debug!("All {} handles dropped", self.class);
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                step = next_step(&mut self.pending) => self.handle_step(step),
                event = next_link_event(&mut self.link_events) => self.handle_link_event(event),
                () = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    self.start_retry();
                }
            }
        }

        self.handle_disconnect().await;
        info!("{} manager stopped", self.class);
    }

    async fn handle_command(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::Connect(filter, reply) => self.handle_connect(filter, reply),
            ManagerCommand::Disconnect(reply) => {
                let warning = self.handle_disconnect().await;
                let _ = reply.send(warning);
            }
            ManagerCommand::Foreground => self.handle_foreground(),
            ManagerCommand::SendCommand(command, reply) => match &self.session {
                Some(session) => {
                    let write = session.write_command(command);
                    tokio::spawn(async move {
                        let _ = reply.send(write.await);
                    });
                }
                None => {
                    let _ = reply.send(Err(BandError::WriteFailed(format!(
                        "No {} is connected",
                        self.class
                    ))));
                }
            },
            ManagerCommand::ReadBattery(reply) => match &self.session {
                Some(session) => {
                    let read = session.read_battery();
                    tokio::spawn(async move {
                        let _ = reply.send(read.await);
                    });
                }
                None => {
                    let _ = reply.send(Err(BandError::NotConnected(self.class.to_string())));
                }
            },
            ManagerCommand::Shutdown(reply) => {
                self.handle_disconnect().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn current_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            class: self.class,
            device_id: self.device_id.clone(),
            state: self.state,
            last_seen: self.last_seen,
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.current_snapshot());
    }

    fn publish_error(&self, error: BandError) {
        let _ = self.events.send(BandEvent::Error {
            class: self.class,
            error,
        });
    }

    fn transition(&mut self, new_state: ConnectionState, reason: TransitionReason) {
        let old_state = self.state;
        self.state = new_state;
        self.last_seen = SystemTime::now();
        info!("{}: {} -> {} ({:?})", self.class, old_state, new_state, reason);

        self.publish_snapshot();
        let _ = self.events.send(BandEvent::StateChanged(StateChange {
            class: self.class,
            device_id: self.device_id.clone(),
            old_state,
            new_state,
            reason,
        }));
    }

    fn handle_connect(
        &mut self,
        filter: DiscoveryFilter,
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    ) {
        if self.state.is_established() {
            debug!("{} already {}, not connecting again", self.class, self.state);
            let _ = reply.send(Ok(self.current_snapshot()));
            return;
        }

        self.waiters.push(reply);
        if self.state.is_connecting() {
            debug!("Attaching to the {} connect in progress", self.class);
            return;
        }

        self.device_id = None;
        self.transition(ConnectionState::Scanning, TransitionReason::ConnectRequested);

        let transport = Arc::clone(&self.transport);
        let scan_timeout = self.params.scan_timeout();
        self.pending = Some(
            async move { Step::Discovered(transport.discover(&filter, scan_timeout).await) }
                .boxed(),
        );
    }

    fn start_open(&mut self, device_id: String) {
        let transport = Arc::clone(&self.transport);
        let limit = self.params.connect_timeout();

        self.pending = Some(
            async move {
                let opened = timeout(limit, transport.open(&device_id))
                    .await
                    .unwrap_or_else(|_| Err(BandError::timeout(limit)));
                Step::Opened(opened)
            }
            .boxed(),
        );
    }

    fn start_resolve(&mut self, link: Arc<dyn Link>) {
        self.opening = Some(Arc::clone(&link));
        let class = self.class;
        let limit = self.params.resolve_timeout();

        self.pending = Some(
            async move {
                let resolved = timeout(limit, async move {
                    let session = DeviceSession::resolve(class, link).await?;
                    let events = session.start_notifications().await?;
                    Ok::<_, BandError>((session, events))
                })
                .await
                .unwrap_or_else(|_| Err(BandError::timeout(limit)));
                Step::Resolved(resolved)
            }
            .boxed(),
        );
    }

    fn handle_step(&mut self, step: Step) {
        match step {
            Step::Discovered(Ok(device)) => {
                info!(
                    "Selected {} {} ({})",
                    self.class,
                    device.id,
                    device.name.as_deref().unwrap_or("unnamed")
                );
                self.device_id = Some(device.id.clone());
                self.transition(ConnectionState::Connecting, TransitionReason::DeviceSelected);
                self.start_open(device.id);
            }
            Step::Opened(Ok(link)) => {
                // Reconnect attempts stay in Reconnecting until they succeed
                if self.state == ConnectionState::Connecting {
                    self.transition(
                        ConnectionState::ResolvingServices,
                        TransitionReason::LinkOpened,
                    );
                }
                self.start_resolve(link);
            }
            Step::Resolved(Ok((session, events))) => self.on_connected(session, events),
            Step::Discovered(Err(e)) | Step::Opened(Err(e)) | Step::Resolved(Err(e)) => {
                self.on_step_failed(e);
            }
        }
    }

    fn on_connected(&mut self, session: DeviceSession, events: BoxStream<'static, LinkEvent>) {
        let id = session.id().to_string();
        self.attempts.entry(id.clone()).or_default().reset();
        self.device_id = Some(id);
        self.opening = None;
        self.session = Some(session);
        self.link_events = Some(events);
        self.transition(ConnectionState::Connected, TransitionReason::ServicesResolved);

        let snapshot = self.current_snapshot();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
    }

    fn on_step_failed(&mut self, error: BandError) {
        self.release_opening();

        if self.state == ConnectionState::Reconnecting {
            warn!("{} reconnect attempt failed: {}", self.class, error);
            self.schedule_retry(false);
            return;
        }

        if error.is_user_visible() {
            warn!("{} connect failed: {}", self.class, error);
            self.publish_error(error.clone());
        } else {
            info!("{} connect ended: {}", self.class, error);
        }
        self.transition(ConnectionState::Idle, TransitionReason::Failed(error.clone()));
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Close a link that never became a session
    fn release_opening(&mut self) {
        if let Some(link) = self.opening.take() {
            tokio::spawn(async move {
                if let Err(e) = link.disconnect().await {
                    debug!("Closing unresolved link {} failed: {}", link.id(), e);
                }
            });
        }
    }

    fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Notification {
                characteristic,
                value,
            }) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                match session.handle_frame(characteristic, &value) {
                    Some(Ok(sample)) => {
                        self.last_seen = sample.timestamp;
                        self.publish_snapshot();
                        let _ = self.events.send(BandEvent::Sample(sample));
                    }
                    Some(Err(e)) => warn!("Dropped {} frame {:02X?}: {}", self.class, value, e),
                    None => debug!("Ignoring notification from {}", characteristic),
                }
            }
            Some(LinkEvent::Disconnected) | None => self.on_link_lost(),
        }
    }

    fn on_link_lost(&mut self) {
        self.link_events = None;
        let Some(session) = self.session.take() else {
            return;
        };
        warn!("Lost link to {} {}", self.class, session.id());
        drop(session);

        self.transition(ConnectionState::Reconnecting, TransitionReason::LinkLost);
        self.schedule_retry(false);
    }

    fn schedule_retry(&mut self, foreground: bool) {
        let Some(id) = self.device_id.clone() else {
            self.give_up(0);
            return;
        };
        let record = self.attempts.get(&id).copied().unwrap_or_default();

        match self
            .policy
            .decide(&record, DisconnectReason::LinkLoss, foreground)
        {
            ReconnectDecision::RetryNow => {
                self.retry_at = None;
                self.start_retry();
            }
            ReconnectDecision::RetryAfter(delay) => {
                info!(
                    "Retrying {} {} in {:?} (attempt {})",
                    self.class,
                    id,
                    delay,
                    record.count + 1
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            ReconnectDecision::GiveUp => self.give_up(record.count),
        }
    }

    fn start_retry(&mut self) {
        let Some(id) = self.device_id.clone() else {
            return;
        };
        let record = self.attempts.entry(id.clone()).or_default();
        record.record_attempt(SystemTime::now());
        info!("Reconnect attempt {} to {} {}", record.count, self.class, id);

        self.transition(ConnectionState::Reconnecting, TransitionReason::RetryStarted);
        self.start_open(id);
    }

    fn give_up(&mut self, attempts: u32) {
        self.retry_at = None;
        if let Some(id) = &self.device_id {
            self.attempts.remove(id);
        }

        let error = BandError::ReconnectExhausted { attempts };
        error!("{}: {}", self.class, error);
        self.transition(ConnectionState::Idle, TransitionReason::Failed(error.clone()));
        self.publish_error(error);
    }

    fn handle_foreground(&mut self) {
        if self.state != ConnectionState::Reconnecting {
            return;
        }
        if self.pending.is_some() {
            debug!("{} reconnect already in flight", self.class);
            return;
        }
        info!("Host active, retrying {} now", self.class);
        self.retry_at = None;
        self.schedule_retry(true);
    }

    async fn handle_disconnect(&mut self) -> Option<BandError> {
        if self.state.is_established() {
            self.release().await
        } else {
            if self.state.is_connecting() {
                self.cancel_connect();
            }
            None
        }
    }

    fn cancel_connect(&mut self) {
        self.pending = None;
        self.release_opening();
        self.transition(ConnectionState::Idle, TransitionReason::Cancelled);

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(BandError::DeviceSelectionCancelled));
        }
    }

    async fn release(&mut self) -> Option<BandError> {
        self.transition(
            ConnectionState::Disconnecting,
            TransitionReason::DisconnectRequested,
        );
        self.pending = None;
        self.retry_at = None;
        self.link_events = None;
        self.release_opening();
        if let Some(id) = self.device_id.clone() {
            let record = self.attempts.remove(&id).unwrap_or_default();
            let decision = self
                .policy
                .decide(&record, DisconnectReason::UserInitiated, false);
            debug!(
                "{} {} released after {} reconnect attempts: {:?}",
                self.class, id, record.count, decision
            );
        }

        let warning = match self.session.take() {
            Some(session) => {
                let limit = self.params.connect_timeout();
                match timeout(limit, session.release()).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(BandError::timeout(limit)),
                }
            }
            None => None,
        };

        if let Some(warning) = &warning {
            warn!("{} released with warning: {}", self.class, warning);
            self.publish_error(warning.clone());
        }
        self.transition(ConnectionState::Idle, TransitionReason::Released);
        warning
    }
}
