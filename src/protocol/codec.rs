// Register protocol codec
//
// Frame address = message-class base + device id. All multi-byte fields are
// little-endian. Decoding never fails: anything unexpected comes back as
// `ProtocolEvent::Unrecognized` and is dropped by the caller.

use serde::Serialize;

use super::registers::{DriveState, Register};
use crate::bus::Frame;

pub type DeviceId = u8;

/// Highest addressable drive
pub const MAX_DEVICE_ID: DeviceId = 127;

/// One address slot per possible drive in every message class
const DEVICE_SLOTS: u16 = 128;

/// Message class base addresses (11-bit)
pub const SYNC_ADDRESS: u16 = 0x080;
pub const TELEMETRY_BASE: u16 = 0x180;
pub const COMMAND_BASE: u16 = 0x200;
pub const RESPONSE_BASE: u16 = 0x300;
pub const CHARACTERIZATION_BASE: u16 = RESPONSE_BASE + 0x80;
pub const STATUS_FEEDBACK_BASE: u16 = 0x400;
pub const MOTION_COMMAND_BASE: u16 = 0x500;
pub const DISCOVERY_ADDRESS: u16 = 0x7FF;

/// Fixed-point scales (raw = value * scale)
const ANGLE_SCALE: f64 = 1e4;
const VELOCITY_SCALE: f64 = 1e2;
const CURRENT_SCALE: f64 = 1e3;
const MOTION_POSITION_SCALE: f64 = 1e4;
const MOTION_VELOCITY_SCALE: f64 = 1e2;
const MOTION_ACCEL_SCALE: f64 = 1e1;

/// Minimum status-feedback payload: angle(4) + velocity(2) + flags(1)
const STATUS_MIN_LEN: usize = 7;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Device id {0} is outside 0..=127")]
    InvalidDeviceId(DeviceId),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Typed value for a register write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    Byte(u8),
    Float(f32),
    Uint(u32),
    /// Fire-and-forget command without payload (restart)
    None,
}

impl RegisterValue {
    fn extend_payload(self, payload: &mut Vec<u8>) {
        match self {
            Self::Byte(v) => payload.push(v),
            Self::Float(v) => payload.extend_from_slice(&v.to_le_bytes()),
            Self::Uint(v) => payload.extend_from_slice(&v.to_le_bytes()),
            Self::None => {}
        }
    }
}

/// Value echoed in a register response
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseValue {
    /// The status register answers with a single enabled byte
    Flag(bool),
    Float(f32),
}

impl ResponseValue {
    pub fn as_f32(self) -> f32 {
        match self {
            Self::Flag(flag) => f32::from(u8::from(flag)),
            Self::Float(v) => v,
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Telemetry {
        device_id: DeviceId,
        angle: f64,
        velocity: f64,
        current_q: f64,
    },
    StatusFeedback {
        device_id: DeviceId,
        angle: f64,
        velocity: f64,
        status_flags: u8,
        /// Absent on 7-byte frames from older firmware
        state: Option<DriveState>,
    },
    RegisterResponse {
        device_id: DeviceId,
        register: u8,
        value: ResponseValue,
    },
    CharacterizationResponse {
        device_id: DeviceId,
        resistance: f32,
        inductance: f32,
    },
    Unrecognized,
}

impl ProtocolEvent {
    pub fn device_id(&self) -> Option<DeviceId> {
        match *self {
            Self::Telemetry { device_id, .. }
            | Self::StatusFeedback { device_id, .. }
            | Self::RegisterResponse { device_id, .. }
            | Self::CharacterizationResponse { device_id, .. } => Some(device_id),
            Self::Unrecognized => None,
        }
    }
}

/// One planned setpoint as carried by a motion command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSetpoint {
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
}

fn check_id(device_id: DeviceId) -> Result<()> {
    if device_id > MAX_DEVICE_ID {
        return Err(ProtocolError::InvalidDeviceId(device_id));
    }
    Ok(())
}

fn address(base: u16, device_id: DeviceId) -> Result<u16> {
    check_id(device_id)?;
    Ok(base + device_id as u16)
}

/// Device id if `address` falls in `base..base + 128`
fn slot(address: u16, base: u16) -> Option<DeviceId> {
    (base..base + DEVICE_SLOTS)
        .contains(&address)
        .then(|| (address - base) as DeviceId)
}

/// Round and clamp to the raw integer range (saturates instead of wrapping)
fn to_i32(value: f64, scale: f64) -> i32 {
    (value * scale).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn to_i16(value: f64, scale: f64) -> i16 {
    (value * scale).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn i32_at(data: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn i16_at(data: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([data[at], data[at + 1]])
}

fn f32_at(data: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

// === Host -> drive ===

/// Register write: `[register] ++ value bytes`
pub fn encode_write(device_id: DeviceId, register: Register, value: RegisterValue) -> Result<Frame> {
    let mut payload = Vec::with_capacity(5);
    payload.push(register.id());
    value.extend_payload(&mut payload);
    Ok(Frame::standard(address(COMMAND_BASE, device_id)?, &payload))
}

/// Register read request: the drive echoes the current value on its response id
pub fn encode_read(device_id: DeviceId, register: Register) -> Result<Frame> {
    Ok(Frame::standard(
        address(COMMAND_BASE, device_id)?,
        &[register.id()],
    ))
}

/// Broadcast asking every drive to announce itself
pub fn discovery_frame() -> Frame {
    Frame::standard(DISCOVERY_ADDRESS, &[])
}

/// Bus-wide barrier that resets every drive's sample clock
pub fn sync_frame() -> Frame {
    Frame::standard(SYNC_ADDRESS, &[])
}

/// Pack a setpoint into the 8-byte motion payload.
/// Packed once and reused for every drive so all receive identical bytes.
pub fn pack_motion_setpoint(setpoint: &MotionSetpoint) -> [u8; 8] {
    let position = to_i32(setpoint.position, MOTION_POSITION_SCALE).to_le_bytes();
    let velocity = to_i16(setpoint.velocity, MOTION_VELOCITY_SCALE).to_le_bytes();
    let accel = to_i16(setpoint.acceleration, MOTION_ACCEL_SCALE).to_le_bytes();

    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&position);
    payload[4..6].copy_from_slice(&velocity);
    payload[6..].copy_from_slice(&accel);
    payload
}

pub fn motion_command_frame(device_id: DeviceId, payload: &[u8; 8]) -> Result<Frame> {
    Ok(Frame::standard(
        address(MOTION_COMMAND_BASE, device_id)?,
        payload,
    ))
}

/// Decode an inbound frame
pub fn decode(frame: &Frame) -> ProtocolEvent {
    let data = frame.payload();
    let addr = frame.address();

    if let Some(device_id) = slot(addr, TELEMETRY_BASE) {
        if data.len() != 8 {
            return ProtocolEvent::Unrecognized;
        }
        return ProtocolEvent::Telemetry {
            device_id,
            angle: i32_at(data, 0) as f64 / ANGLE_SCALE,
            velocity: i16_at(data, 4) as f64 / VELOCITY_SCALE,
            current_q: i16_at(data, 6) as f64 / CURRENT_SCALE,
        };
    }

    if let Some(device_id) = slot(addr, STATUS_FEEDBACK_BASE) {
        if data.len() < STATUS_MIN_LEN {
            return ProtocolEvent::Unrecognized;
        }
        return ProtocolEvent::StatusFeedback {
            device_id,
            angle: i32_at(data, 0) as f64 / ANGLE_SCALE,
            velocity: i16_at(data, 4) as f64 / VELOCITY_SCALE,
            status_flags: data[6],
            state: data.get(7).map(|&raw| DriveState::from(raw)),
        };
    }

    if let Some(device_id) = slot(addr, RESPONSE_BASE) {
        let Some(&register) = data.first() else {
            return ProtocolEvent::Unrecognized;
        };
        let value = if register == Register::Status.id() && data.len() >= 2 {
            ResponseValue::Flag(data[1] > 0)
        } else if data.len() >= 5 {
            ResponseValue::Float(f32_at(data, 1))
        } else {
            return ProtocolEvent::Unrecognized;
        };
        return ProtocolEvent::RegisterResponse {
            device_id,
            register,
            value,
        };
    }

    if let Some(device_id) = slot(addr, CHARACTERIZATION_BASE) {
        if data.len() != 8 {
            return ProtocolEvent::Unrecognized;
        }
        return ProtocolEvent::CharacterizationResponse {
            device_id,
            resistance: f32_at(data, 0),
            inductance: f32_at(data, 4),
        };
    }

    ProtocolEvent::Unrecognized
}

// === Drive -> host (used by the simulated drives) ===

pub fn encode_telemetry(
    device_id: DeviceId,
    angle: f64,
    velocity: f64,
    current_q: f64,
) -> Result<Frame> {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&to_i32(angle, ANGLE_SCALE).to_le_bytes());
    payload[4..6].copy_from_slice(&to_i16(velocity, VELOCITY_SCALE).to_le_bytes());
    payload[6..].copy_from_slice(&to_i16(current_q, CURRENT_SCALE).to_le_bytes());
    Ok(Frame::standard(address(TELEMETRY_BASE, device_id)?, &payload))
}

pub fn encode_status_feedback(
    device_id: DeviceId,
    angle: f64,
    velocity: f64,
    status_flags: u8,
    state: u8,
) -> Result<Frame> {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&to_i32(angle, ANGLE_SCALE).to_le_bytes());
    payload[4..6].copy_from_slice(&to_i16(velocity, VELOCITY_SCALE).to_le_bytes());
    payload[6] = status_flags;
    payload[7] = state;
    Ok(Frame::standard(
        address(STATUS_FEEDBACK_BASE, device_id)?,
        &payload,
    ))
}

pub fn encode_response(device_id: DeviceId, register: u8, value: ResponseValue) -> Result<Frame> {
    let mut payload = Vec::with_capacity(5);
    payload.push(register);
    match value {
        ResponseValue::Flag(flag) => payload.push(u8::from(flag)),
        ResponseValue::Float(v) => payload.extend_from_slice(&v.to_le_bytes()),
    }
    Ok(Frame::standard(address(RESPONSE_BASE, device_id)?, &payload))
}

pub fn encode_characterization(
    device_id: DeviceId,
    resistance: f32,
    inductance: f32,
) -> Result<Frame> {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&resistance.to_le_bytes());
    payload[4..].copy_from_slice(&inductance.to_le_bytes());
    Ok(Frame::standard(
        address(CHARACTERIZATION_BASE, device_id)?,
        &payload,
    ))
}

/// Split a host command frame into (device, register, value bytes)
pub fn decode_command(frame: &Frame) -> Option<(DeviceId, u8, &[u8])> {
    let device_id = slot(frame.address(), COMMAND_BASE)?;
    let (&register, value) = frame.payload().split_first()?;
    Some((device_id, register, value))
}

pub fn decode_motion_command(frame: &Frame) -> Option<(DeviceId, MotionSetpoint)> {
    let device_id = slot(frame.address(), MOTION_COMMAND_BASE)?;
    let data = frame.payload();
    if data.len() != 8 {
        return None;
    }
    Some((
        device_id,
        MotionSetpoint {
            position: i32_at(data, 0) as f64 / MOTION_POSITION_SCALE,
            velocity: i16_at(data, 4) as f64 / MOTION_VELOCITY_SCALE,
            acceleration: i16_at(data, 6) as f64 / MOTION_ACCEL_SCALE,
        },
    ))
}
