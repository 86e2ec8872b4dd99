use crate::{
    error::{BandError, Result},
    types::{BreathingSample, DeviceClass, HeartRateSample, Sample},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Command frame size in bytes
pub const COMMAND_SIZE: usize = 3;

/// Breathing telemetry frame size in bytes
pub const BREATHING_FRAME_SIZE: usize = 4;

/// Highest heart rate accepted from a measurement frame
pub const MAX_HEART_RATE_BPM: u16 = 300;

/// Heart-rate flags bit selecting a 16-bit value
const HR_FLAG_VALUE_U16: u8 = 0x01;

/// Command type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    /// Resistance motor control
    Motor = 0x01,
}

/// Command action byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandAction {
    /// Stop the motor
    Stop = 0x00,
    /// Start the motor
    Start = 0x01,
}

/// Command target application byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetApp {
    /// Breathing training
    Breathing = 0x01,
}

/// Outbound instruction for the breathing band
///
/// Frame layout, no length prefix and no checksum:
/// - Byte 0: command type
/// - Byte 1: action
/// - Byte 2: target application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command type
    pub kind: CommandType,
    /// Action to perform
    pub action: CommandAction,
    /// Target application
    pub app: TargetApp,
}

impl Command {
    /// Create a command
    #[must_use]
    pub const fn new(kind: CommandType, action: CommandAction, app: TargetApp) -> Self {
        Self { kind, action, app }
    }

    /// Start breathing training
    #[must_use]
    pub const fn start_training() -> Self {
        Self::new(CommandType::Motor, CommandAction::Start, TargetApp::Breathing)
    }

    /// Stop breathing training
    #[must_use]
    pub const fn stop_training() -> Self {
        Self::new(CommandType::Motor, CommandAction::Stop, TargetApp::Breathing)
    }

    /// Serialize command to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_SIZE);
        buf.put_slice(&build_command(self.kind, self.action, self.app));
        buf.freeze()
    }
}

/// Assemble a command frame
///
/// Only byte assembly happens here; combinations are chosen by the caller.
#[must_use]
pub const fn build_command(kind: CommandType, action: CommandAction, app: TargetApp) -> [u8; 3] {
    [kind as u8, action as u8, app as u8]
}

/// Parse a Heart Rate Measurement notification
///
/// Frame structure (Bluetooth Heart Rate profile):
/// - Byte 0: flags, bit 0 selects the value width
/// - Byte 1: heart rate as u8, or
/// - Bytes 1-2: heart rate as u16 little-endian
/// - Remaining bytes (energy expended, RR intervals) are ignored
///
/// # Errors
///
/// Returns [`BandError::MalformedFrame`] if the frame is too short for its
/// flags or the value exceeds [`MAX_HEART_RATE_BPM`].
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateSample> {
    let mut buf = data;
    if buf.remaining() < 2 {
        return Err(BandError::MalformedFrame(format!(
            "Heart-rate frame too short: {} bytes",
            data.len()
        )));
    }

    let flags = buf.get_u8();
    let bpm = if flags & HR_FLAG_VALUE_U16 != 0 {
        if buf.remaining() < 2 {
            return Err(BandError::MalformedFrame(format!(
                "Heart-rate frame too short for 16-bit value: {} bytes",
                data.len()
            )));
        }
        buf.get_u16_le()
    } else {
        u16::from(buf.get_u8())
    };

    if bpm > MAX_HEART_RATE_BPM {
        return Err(BandError::MalformedFrame(format!(
            "Heart rate {bpm} bpm out of range"
        )));
    }

    Ok(HeartRateSample { bpm })
}

/// Parse a breathing telemetry notification
///
/// The frame is exactly one IEEE-754 f32, little-endian.
///
/// # Errors
///
/// Returns [`BandError::MalformedFrame`] if the frame is not 4 bytes long.
pub fn decode_breathing(data: &[u8]) -> Result<BreathingSample> {
    if data.len() != BREATHING_FRAME_SIZE {
        return Err(BandError::MalformedFrame(format!(
            "Breathing frame must be {BREATHING_FRAME_SIZE} bytes, got {}",
            data.len()
        )));
    }

    let mut buf = data;
    Ok(BreathingSample {
        rate: buf.get_f32_le(),
    })
}

/// Serialize a breathing sample back into its wire form
#[must_use]
pub fn encode_breathing(sample: BreathingSample) -> [u8; 4] {
    sample.rate.to_le_bytes()
}

/// Parse a Battery Level read (one byte, percent)
///
/// # Errors
///
/// Returns [`BandError::MalformedFrame`] if the payload is empty or above 100.
pub fn decode_battery_level(data: &[u8]) -> Result<u8> {
    match data.first() {
        Some(&level) if level <= 100 => Ok(level),
        Some(&level) => Err(BandError::MalformedFrame(format!(
            "Battery level {level}% out of range"
        ))),
        None => Err(BandError::MalformedFrame(
            "Battery level payload is empty".to_string(),
        )),
    }
}

/// Decode a notification with the codec profile of its device class
///
/// # Errors
///
/// Returns [`BandError::MalformedFrame`] if the frame does not decode.
pub fn decode(class: DeviceClass, data: &[u8]) -> Result<Sample> {
    match class {
        DeviceClass::HeartRate => decode_heart_rate(data).map(Sample::HeartRate),
        DeviceClass::Breathing => decode_breathing(data).map(Sample::Breathing),
    }
}
