use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the band communication core
///
/// Every transport failure is translated into one of these variants before it
/// reaches a caller or an observer. The type is `Clone` so that it can travel
/// inside [`crate::types::BandEvent`] values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BandError {
    /// No usable Bluetooth transport is present
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// Discovery ended without a device being selected
    #[error("Device selection cancelled")]
    DeviceSelectionCancelled,

    /// The connect step did not finish in time
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The device does not expose the expected service
    #[error("Service {0} not found on device")]
    ServiceNotFound(Uuid),

    /// The device does not expose the expected characteristic
    #[error("Characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),

    /// A notification payload could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The link dropped without being asked to
    #[error("Unexpected disconnect: {0}")]
    UnexpectedDisconnect(String),

    /// The reconnection policy gave up
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of reconnect attempts made
        attempts: u32,
    },

    /// A command write did not reach the device
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The operation needs a connected device
    #[error("No {0} is connected")]
    NotConnected(String),

    /// The last-known device store failed
    #[error("Device store error: {0}")]
    Storage(String),

    /// The connection manager task is no longer running
    #[error("Connection manager has shut down")]
    ManagerClosed,
}

/// Result type for band operations
pub type Result<T> = std::result::Result<T, BandError>;

impl BandError {
    /// Timeout error for a step bounded by `after`
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::ConnectionTimeout {
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Check if this error leaves nothing to recover
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BluetoothUnavailable(_) | Self::ReconnectExhausted { .. } | Self::ManagerClosed
        )
    }

    /// Check if this error should be shown to the user
    ///
    /// Cancelled selections and dropped frames are handled silently.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            Self::DeviceSelectionCancelled | Self::MalformedFrame(_) | Self::Storage(_)
        )
    }

    /// Check if this error is handed to the reconnection policy
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UnexpectedDisconnect(_))
    }

    /// Check if this error points at a wrong or incompatible device
    #[must_use]
    pub const fn is_incompatible_device(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotFound(_) | Self::CharacteristicNotFound(_)
        )
    }
}

/// Translate a btleplug error raised while the link is being set up or used
///
/// Adapter-level problems become [`BandError::BluetoothUnavailable`]; anything
/// that happens to an individual peripheral is treated as link loss.
impl From<btleplug::Error> for BandError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied | btleplug::Error::NotSupported(_) => {
                Self::BluetoothUnavailable(err.to_string())
            }
            btleplug::Error::TimedOut(duration) => Self::timeout(duration),
            other => Self::UnexpectedDisconnect(other.to_string()),
        }
    }
}
