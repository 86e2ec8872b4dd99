#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bandlink
//!
//! Device-communication core for a breathing and heart-rate training app.
//!
//! The crate manages live Bluetooth Low Energy links to two classes of
//! wearables and turns their notifications into typed samples:
//!
//! - **Heart-rate band**: standard Heart Rate profile (service `0x180D`,
//!   measurement characteristic `0x2A37`)
//! - **Breathing band**: proprietary protocol with a 4-byte float telemetry
//!   frame and a fixed 3-byte command frame
//!
//! ## Components
//!
//! - [`protocol`]: pure frame codec
//! - [`session`]: one open connection and its resolved characteristics
//! - [`manager`]: connection state machine, one task per device class
//! - [`reconnect`]: pure retry/backoff policy
//! - [`registry`]: one manager per device class plus last-known devices
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bandlink::{BandEvent, BtleplugTransport, DeviceClass, MemoryStore, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let registry = SessionRegistry::new(transport, Arc::new(MemoryStore::default()));
//!     let mut events = registry.subscribe();
//!
//!     registry.connect_default(DeviceClass::HeartRate).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let BandEvent::Sample(sample) = event {
//!             println!("{:?}", sample.sample);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/// Transport boundary and its btleplug implementation
pub mod ble;
/// Error types and handling
pub mod error;
/// Connection state machine
pub mod manager;
/// Frame encoding and decoding
pub mod protocol;
/// Reconnection policy
pub mod reconnect;
/// Per-class session registry and last-known device persistence
pub mod registry;
/// Open device session
pub mod session;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use ble::{BtleplugTransport, Link, LinkEvent, Transport};
pub use error::{BandError, Result};
pub use manager::ConnectionManager;
pub use protocol::{build_command, Command, CommandAction, CommandType, TargetApp};
pub use reconnect::{ReconnectAttemptRecord, ReconnectDecision, ReconnectPolicy};
pub use registry::{DeviceStore, MemoryStore, SessionRegistry};
pub use session::DeviceSession;
pub use types::{
    BandEvent, BreathingSample, ConnectionParams, ConnectionState, DeviceClass, DeviceInfo,
    DisconnectReason, DiscoveryFilter, HeartRateSample, ReconnectConfig, Sample, SampleEvent,
    ServiceInfo, SessionSnapshot, StateChange, TransitionReason,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Heart Rate service
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);

/// Heart Rate Measurement characteristic (notify)
pub const HEART_RATE_MEASUREMENT_CHAR_UUID: Uuid = uuid_from_u16(0x2A37);

/// Breathing band primary service
///
/// Vendor-specific 16-bit identifier expanded against the Bluetooth base UUID.
/// Earlier firmware drafts used `0x00FF`/`0xFF01` for service/telemetry; the
/// `0xFF01`/`0xFF02`/`0xFF03` layout is the one the current bands expose.
pub const BREATHING_SERVICE_UUID: Uuid = uuid_from_u16(0xFF01);

/// Breathing band telemetry characteristic (notify, 4-byte float)
pub const BREATHING_TELEMETRY_CHAR_UUID: Uuid = uuid_from_u16(0xFF02);

/// Breathing band command characteristic (write, 3-byte frame)
pub const BREATHING_COMMAND_CHAR_UUID: Uuid = uuid_from_u16(0xFF03);

/// Local-name prefix advertised by breathing bands
pub const BREATHING_NAME_PREFIX: &str = "SYNC";

/// Battery service, optional on both bands
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180F);

/// Battery Level characteristic (read, one byte percent)
pub const BATTERY_LEVEL_CHAR_UUID: Uuid = uuid_from_u16(0x2A19);
