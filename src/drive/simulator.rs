// Simulated drives for the loopback bus
//
// Plays the firmware side of the protocol well enough to exercise the host:
// answers discovery with telemetry, echoes register reads, applies writes,
// follows motion commands with status feedback and reports a fixed motor model
// when asked to characterize.

use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::bus::{Frame, FrameResponder};
use crate::protocol::codec::{
    DISCOVERY_ADDRESS, decode_command, decode_motion_command, encode_characterization,
    encode_response, encode_status_feedback, encode_telemetry,
};
use crate::protocol::{ControlMode, DeviceId, MAX_DEVICE_ID, Register, ResponseValue, ValueKind};

/// Motor model reported by characterization
pub const SIM_PHASE_RESISTANCE: f32 = 1.2; // ohm
pub const SIM_PHASE_INDUCTANCE: f32 = 0.0005; // H

/// Drive state byte reported in status feedback
const STATE_OPERATIONAL: u8 = 2;

#[derive(Debug, Clone)]
struct SimulatedDrive {
    angle: f64,
    velocity: f64,
    enabled: bool,
    control_mode: ControlMode,
    sensor_flipped: bool,
    telemetry_period_us: u32,
    /// Applied on the next restart
    pending_address: Option<DeviceId>,
    registers: BTreeMap<u8, f32>,
}

impl SimulatedDrive {
    fn new() -> Self {
        let mut registers = BTreeMap::new();
        registers.insert(Register::VoltageLimit.id(), 12.0);
        registers.insert(Register::CurrentLimit.id(), 2.0);
        registers.insert(Register::VelocityLimit.id(), 20.0);
        registers.insert(Register::DriverVoltagePsu.id(), 24.0);
        registers.insert(Register::PolePairs.id(), 7.0);
        Self {
            angle: 0.0,
            velocity: 0.0,
            enabled: false,
            control_mode: ControlMode::default(),
            sensor_flipped: false,
            telemetry_period_us: 10_000,
            pending_address: None,
            registers,
        }
    }

    fn status_flags(&self) -> u8 {
        u8::from(self.enabled) | (u8::from(self.sensor_flipped) << 1)
    }

    fn read(&self, register: Register) -> ResponseValue {
        match register {
            Register::Status => ResponseValue::Flag(self.enabled),
            Register::Enable => ResponseValue::Float(f32::from(u8::from(self.enabled))),
            Register::ControlMode => ResponseValue::Float(f32::from(self.control_mode as u8)),
            Register::Angle => ResponseValue::Float(self.angle as f32),
            Register::Velocity => ResponseValue::Float(self.velocity as f32),
            Register::TelemetryPeriod => ResponseValue::Float(self.telemetry_period_us as f32),
            other => ResponseValue::Float(
                self.registers.get(&other.id()).copied().unwrap_or_default(),
            ),
        }
    }
}

/// Little-endian value bytes of a register write, widened to f32
fn write_value(kind: ValueKind, bytes: &[u8]) -> Option<f32> {
    match kind {
        ValueKind::Byte => bytes.first().map(|&b| f32::from(b)),
        ValueKind::Float32 => bytes
            .get(..4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        ValueKind::Uint32 => bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32),
        ValueKind::None => Some(0.0),
    }
}

/// A set of drives sharing one loopback bus
#[derive(Debug, Clone, Default)]
pub struct SimulatedDrives {
    drives: BTreeMap<DeviceId, SimulatedDrive>,
}

impl SimulatedDrives {
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        let drives = ids
            .into_iter()
            .filter(|&id| id <= MAX_DEVICE_ID)
            .map(|id| (id, SimulatedDrive::new()))
            .collect();
        Self { drives }
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.drives.keys().copied().collect()
    }

    fn telemetry(id: DeviceId, drive: &SimulatedDrive) -> Option<Frame> {
        encode_telemetry(id, drive.angle, drive.velocity, 0.0).ok()
    }

    fn on_command(&mut self, id: DeviceId, register: u8, value: &[u8]) -> Vec<Frame> {
        let Some(register) = Register::from_id(register) else {
            trace!("Drive {} ignoring unknown register 0x{:02X}", id, register);
            return Vec::new();
        };
        let Some(drive) = self.drives.get_mut(&id) else {
            return Vec::new();
        };

        // A bare register byte is a read request (except for payload-less commands)
        if value.is_empty() && register.kind() != ValueKind::None {
            return encode_response(id, register.id(), drive.read(register))
                .into_iter()
                .collect();
        }

        let Some(raw) = write_value(register.kind(), value) else {
            debug!("Drive {} got a short write to {:?}", id, register);
            return Vec::new();
        };
        match register {
            Register::Enable => drive.enabled = raw != 0.0,
            Register::ControlMode => {
                if let Some(mode) = ControlMode::from_raw(raw as u8) {
                    drive.control_mode = mode;
                }
            }
            Register::Target => {
                if drive.enabled && drive.control_mode == ControlMode::Angle {
                    drive.angle = f64::from(raw);
                }
            }
            Register::TelemetryPeriod => drive.telemetry_period_us = raw as u32,
            Register::FlipSensorDirection => drive.sensor_flipped = !drive.sensor_flipped,
            Register::MotorAddress => drive.pending_address = Some(raw as DeviceId),
            Register::CharacterizeMotor => {
                drive
                    .registers
                    .insert(Register::PhaseResistance.id(), SIM_PHASE_RESISTANCE);
                drive
                    .registers
                    .insert(Register::Inductance.id(), SIM_PHASE_INDUCTANCE);
                return encode_characterization(id, SIM_PHASE_RESISTANCE, SIM_PHASE_INDUCTANCE)
                    .into_iter()
                    .collect();
            }
            Register::Restart => return self.restart(id),
            other => {
                drive.registers.insert(other.id(), raw);
            }
        }
        Vec::new()
    }

    /// Reboot a drive, moving it to its pending address, and announce it
    fn restart(&mut self, id: DeviceId) -> Vec<Frame> {
        let Some(mut drive) = self.drives.remove(&id) else {
            return Vec::new();
        };
        let new_id = match drive.pending_address.take() {
            Some(new_id) if new_id <= MAX_DEVICE_ID && !self.drives.contains_key(&new_id) => {
                debug!("Drive {} restarting as {}", id, new_id);
                new_id
            }
            _ => id,
        };
        drive.enabled = false;
        let announce = Self::telemetry(new_id, &drive);
        self.drives.insert(new_id, drive);
        announce.into_iter().collect()
    }
}

impl FrameResponder for SimulatedDrives {
    fn respond(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.address() == DISCOVERY_ADDRESS {
            return self
                .drives
                .iter()
                .filter_map(|(&id, drive)| Self::telemetry(id, drive))
                .collect();
        }

        if let Some((id, setpoint)) = decode_motion_command(frame) {
            let Some(drive) = self.drives.get_mut(&id) else {
                return Vec::new();
            };
            drive.angle = setpoint.position;
            drive.velocity = setpoint.velocity;
            return encode_status_feedback(
                id,
                drive.angle,
                drive.velocity,
                drive.status_flags(),
                STATE_OPERATIONAL,
            )
            .into_iter()
            .collect();
        }

        if let Some((id, register, value)) = decode_command(frame) {
            return self.on_command(id, register, value);
        }

        // Sync barriers and anything else need no answer
        Vec::new()
    }
}
