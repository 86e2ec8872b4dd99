use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::SystemTime};
use uuid::Uuid;

use crate::{
    error::BandError, BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, BREATHING_COMMAND_CHAR_UUID,
    BREATHING_NAME_PREFIX, BREATHING_SERVICE_UUID, BREATHING_TELEMETRY_CHAR_UUID,
    HEART_RATE_MEASUREMENT_CHAR_UUID, HEART_RATE_SERVICE_UUID,
};

/// The two supported peripheral categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Heart-rate band speaking the standard Heart Rate profile
    HeartRate,
    /// Breathing-resistance band speaking the proprietary protocol
    Breathing,
}

impl DeviceClass {
    /// All device classes, in registry order
    pub const ALL: [Self; 2] = [Self::HeartRate, Self::Breathing];

    /// Primary service the device advertises
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::HeartRate => HEART_RATE_SERVICE_UUID,
            Self::Breathing => BREATHING_SERVICE_UUID,
        }
    }

    /// Characteristic that carries sample notifications
    #[must_use]
    pub const fn read_characteristic(self) -> Uuid {
        match self {
            Self::HeartRate => HEART_RATE_MEASUREMENT_CHAR_UUID,
            Self::Breathing => BREATHING_TELEMETRY_CHAR_UUID,
        }
    }

    /// Characteristic that accepts command frames, if the profile has one
    #[must_use]
    pub const fn command_characteristic(self) -> Option<Uuid> {
        match self {
            Self::HeartRate => None,
            Self::Breathing => Some(BREATHING_COMMAND_CHAR_UUID),
        }
    }

    /// Discovery filter used when the caller has no preference
    #[must_use]
    pub fn default_filter(self) -> DiscoveryFilter {
        let filter = DiscoveryFilter::for_class(self);
        match self {
            Self::HeartRate => filter,
            Self::Breathing => filter.with_name_prefix(BREATHING_NAME_PREFIX),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "heart-rate band"),
            Self::Breathing => write!(f, "breathing band"),
        }
    }
}

/// Connection lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and nothing in flight
    Idle,
    /// Looking for a matching device
    Scanning,
    /// Opening the GATT connection
    Connecting,
    /// Looking up services and characteristics
    ResolvingServices,
    /// Notifications are flowing
    Connected,
    /// Tearing down on request
    Disconnecting,
    /// Link lost, recovery in progress
    Reconnecting,
}

impl ConnectionState {
    /// Check if a connect sequence is currently running
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::ResolvingServices
        )
    }

    /// Check if the session holds (or is recovering) a live link
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ResolvingServices => write!(f, "Resolving Services"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Why a link went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The caller asked for the disconnect
    UserInitiated,
    /// The transport reported the link gone
    LinkLoss,
}

/// Why a state transition happened
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionReason {
    /// A caller asked to connect
    ConnectRequested,
    /// Discovery produced a device
    DeviceSelected,
    /// The GATT connection opened
    LinkOpened,
    /// Services and characteristics were found and notifications started
    ServicesResolved,
    /// A caller asked to disconnect
    DisconnectRequested,
    /// The disconnect finished
    Released,
    /// A pending connect was cancelled by a disconnect
    Cancelled,
    /// The transport dropped the link
    LinkLost,
    /// A reconnect attempt is starting
    RetryStarted,
    /// The connect sequence or a reconnect failed
    Failed(BandError),
}

/// Read-only view of a device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Device class the session belongs to
    pub class: DeviceClass,
    /// Platform identifier of the selected device, once one is selected
    pub device_id: Option<String>,
    /// Current state
    pub state: ConnectionState,
    /// Time of the last frame or state transition
    pub last_seen: SystemTime,
}

impl SessionSnapshot {
    /// Create an idle snapshot for a device class
    #[must_use]
    pub fn idle(class: DeviceClass) -> Self {
        Self {
            class,
            device_id: None,
            state: ConnectionState::Idle,
            last_seen: SystemTime::now(),
        }
    }
}

/// Constraints applied to device discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Services the device must advertise
    pub services: Vec<Uuid>,
    /// Required local-name prefix
    pub name_prefix: Option<String>,
    /// Device ids to prefer without rescanning, most recent first
    pub known_ids: Vec<String>,
}

impl DiscoveryFilter {
    /// Filter on the primary service of a device class
    #[must_use]
    pub fn for_class(class: DeviceClass) -> Self {
        Self {
            services: vec![class.service_uuid()],
            name_prefix: None,
            known_ids: Vec::new(),
        }
    }

    /// Also require a local-name prefix
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Prefer already-known devices
    #[must_use]
    pub fn with_known_ids(mut self, ids: Vec<String>) -> Self {
        self.known_ids = ids;
        self
    }

    /// Check whether an advertised name passes the prefix filter
    #[must_use]
    pub fn accepts_name(&self, name: Option<&str>) -> bool {
        match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// A device selected by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Opaque platform identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

/// A service and the characteristics it exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristic UUIDs within the service
    pub characteristics: Vec<Uuid>,
}

impl ServiceInfo {
    /// Create service info
    #[must_use]
    pub const fn new(uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Battery service with its level characteristic
    #[must_use]
    pub fn battery() -> Self {
        Self::new(BATTERY_SERVICE_UUID, vec![BATTERY_LEVEL_CHAR_UUID])
    }
}

/// Heart-rate reading in beats per minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Beats per minute, 0 to 300
    pub bpm: u16,
}

/// Breathing-band reading
///
/// The value is passed through as the device reports it; sign and magnitude
/// are device-defined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreathingSample {
    /// Instantaneous resistance/flow value
    pub rate: f32,
}

/// A decoded physiological reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    /// From the heart-rate band
    HeartRate(HeartRateSample),
    /// From the breathing band
    Breathing(BreathingSample),
}

/// State transition published to observers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Device class of the session
    pub class: DeviceClass,
    /// Device id, when one is selected
    pub device_id: Option<String>,
    /// State before the transition
    pub old_state: ConnectionState,
    /// State after the transition
    pub new_state: ConnectionState,
    /// What caused it
    pub reason: TransitionReason,
}

/// Sample published to observers
#[derive(Debug, Clone, PartialEq)]
pub struct SampleEvent {
    /// Device class the sample came from
    pub class: DeviceClass,
    /// Decoded sample
    pub sample: Sample,
    /// Decode time
    pub timestamp: SystemTime,
}

/// Event published on the observer channel
#[derive(Debug, Clone, PartialEq)]
pub enum BandEvent {
    /// A session changed state
    StateChanged(StateChange),
    /// A frame was decoded
    Sample(SampleEvent),
    /// A non-fatal warning or a terminal error
    Error {
        /// Device class the error belongs to
        class: DeviceClass,
        /// The error
        error: BandError,
    },
}

impl BandEvent {
    /// Device class this event belongs to
    #[must_use]
    pub const fn class(&self) -> DeviceClass {
        match self {
            Self::StateChanged(change) => change.class,
            Self::Sample(sample) => sample.class,
            Self::Error { class, .. } => *class,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// How long discovery may run before giving up, in milliseconds
    pub scan_timeout_ms: u64,
    /// Bound on the connect step, in milliseconds
    pub connect_timeout_ms: u64,
    /// Bound on service resolution, in milliseconds
    pub resolve_timeout_ms: u64,
    /// Capacity of the observer event channel
    pub event_capacity: usize,
    /// Number of last-known device ids remembered per class
    pub last_known_limit: usize,
}

impl ConnectionParams {
    /// Scan timeout as a duration
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Connect timeout as a duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Resolve timeout as a duration
    #[must_use]
    pub const fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
            resolve_timeout_ms: 10_000,
            event_capacity: 256,
            last_known_limit: 5,
        }
    }
}

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts retried immediately before backoff starts
    pub immediate_attempts: u32,
    /// Attempts allowed in total before giving up
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            immediate_attempts: 3,
            max_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}
