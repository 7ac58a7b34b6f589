// Drive register map
//
// Numbering follows the SimpleFOC register layout; 0xA0 and up are
// firmware-specific commands.

use serde::{Deserialize, Serialize};

/// Register addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Register {
    // State and commands
    Status = 0x00, // read-only, echoed as a 1-byte flag
    Target = 0x01,
    Enable = 0x04,      // 1 byte: 0=off, 1=on
    ControlMode = 0x05, // 1 byte: 0=torque, 1=velocity, 2=angle
    TorqueMode = 0x06,
    ModulationMode = 0x07,
    Angle = 0x09,
    Velocity = 0x11,

    // Velocity loop
    VelPidP = 0x30,
    VelPidI = 0x31,
    VelPidD = 0x32,
    VelPidLim = 0x33,
    VelPidRamp = 0x34,
    VelLpfT = 0x35,

    // Angle loop
    AngPidP = 0x36,
    AngPidI = 0x37,
    AngPidD = 0x38,
    AngPidLim = 0x39,
    AngPidRamp = 0x3A,

    // Current loops
    CurqPidP = 0x40,
    CurqPidI = 0x41,
    CurqPidD = 0x42,
    CurqLpfT = 0x45,
    CurdPidP = 0x46,
    CurdPidI = 0x47,
    CurdPidD = 0x48,
    CurdLpfT = 0x4B,

    // Limits
    VoltageLimit = 0x50,
    CurrentLimit = 0x51,
    VelocityLimit = 0x52,
    DriverVoltagePsu = 0x55,
    VoltageSensorAlign = 0x56,

    // Motor physical parameters
    PolePairs = 0x63,
    PhaseResistance = 0x64,
    Kv = 0x65,
    Inductance = 0x66,

    MotorAddress = 0x7F, // 1 byte, takes effect after restart

    // Firmware commands
    TelemetryPeriod = 0xA0,     // u32 microseconds, 0 disables
    FlipSensorDirection = 0xA1, // 1 byte
    CharacterizeMotor = 0xA2,   // f32 test voltage, answers on the characterization range
    Restart = 0xA3,             // no payload
}

/// Wire type of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Byte,
    Float32,
    Uint32,
    None,
}

/// Every register, in address order
const ALL: [Register; 41] = [
    Register::Status,
    Register::Target,
    Register::Enable,
    Register::ControlMode,
    Register::TorqueMode,
    Register::ModulationMode,
    Register::Angle,
    Register::Velocity,
    Register::VelPidP,
    Register::VelPidI,
    Register::VelPidD,
    Register::VelPidLim,
    Register::VelPidRamp,
    Register::VelLpfT,
    Register::AngPidP,
    Register::AngPidI,
    Register::AngPidD,
    Register::AngPidLim,
    Register::AngPidRamp,
    Register::CurqPidP,
    Register::CurqPidI,
    Register::CurqPidD,
    Register::CurqLpfT,
    Register::CurdPidP,
    Register::CurdPidI,
    Register::CurdPidD,
    Register::CurdLpfT,
    Register::VoltageLimit,
    Register::CurrentLimit,
    Register::VelocityLimit,
    Register::DriverVoltagePsu,
    Register::VoltageSensorAlign,
    Register::PolePairs,
    Register::PhaseResistance,
    Register::Kv,
    Register::Inductance,
    Register::MotorAddress,
    Register::TelemetryPeriod,
    Register::FlipSensorDirection,
    Register::CharacterizeMotor,
    Register::Restart,
];

/// Tunable parameters requested when a drive is selected
pub const PARAMETER_REGISTERS: [Register; 28] = [
    Register::VoltageLimit,
    Register::CurrentLimit,
    Register::VelocityLimit,
    Register::DriverVoltagePsu,
    Register::VoltageSensorAlign,
    Register::PolePairs,
    Register::PhaseResistance,
    Register::Kv,
    Register::Inductance,
    Register::AngPidP,
    Register::AngPidI,
    Register::AngPidD,
    Register::AngPidRamp,
    Register::AngPidLim,
    Register::VelPidP,
    Register::VelPidI,
    Register::VelPidD,
    Register::VelLpfT,
    Register::VelPidRamp,
    Register::VelPidLim,
    Register::CurqPidP,
    Register::CurqPidI,
    Register::CurqPidD,
    Register::CurqLpfT,
    Register::CurdPidP,
    Register::CurdPidI,
    Register::CurdPidD,
    Register::CurdLpfT,
];

impl Register {
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up a register by its address byte
    pub fn from_id(id: u8) -> Option<Self> {
        ALL.iter().copied().find(|r| r.id() == id)
    }

    /// Wire type used when writing this register
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Enable
            | Self::ControlMode
            | Self::TorqueMode
            | Self::ModulationMode
            | Self::PolePairs
            | Self::MotorAddress
            | Self::FlipSensorDirection
            | Self::Status => ValueKind::Byte,
            Self::TelemetryPeriod => ValueKind::Uint32,
            Self::Restart => ValueKind::None,
            _ => ValueKind::Float32,
        }
    }
}

/// Drive control modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Torque = 0,
    Velocity = 1,
    #[default]
    Angle = 2,
}

impl ControlMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Torque),
            1 => Some(Self::Velocity),
            2 => Some(Self::Angle),
            _ => None,
        }
    }
}

/// Drive state machine as reported in status feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    #[default]
    Initializing,
    Ready,
    Operational,
    Fault,
    Unknown(u8),
}

impl From<u8> for DriveState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Ready,
            2 => Self::Operational,
            3 => Self::Fault,
            other => Self::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup() {
        assert_eq!(Register::from_id(0x30), Some(Register::VelPidP));
        assert_eq!(Register::from_id(0xA3), Some(Register::Restart));
        assert_eq!(Register::from_id(0x02), None);
        for register in PARAMETER_REGISTERS {
            assert_eq!(Register::from_id(register.id()), Some(register));
        }
    }

    #[test]
    fn test_value_kinds() {
        assert_eq!(Register::Enable.kind(), ValueKind::Byte);
        assert_eq!(Register::Target.kind(), ValueKind::Float32);
        assert_eq!(Register::TelemetryPeriod.kind(), ValueKind::Uint32);
        assert_eq!(Register::Restart.kind(), ValueKind::None);
    }

    #[test]
    fn test_drive_state_from_raw() {
        assert_eq!(DriveState::from(2), DriveState::Operational);
        assert_eq!(DriveState::from(9), DriveState::Unknown(9));
        assert_eq!(ControlMode::from_raw(1), Some(ControlMode::Velocity));
        assert_eq!(ControlMode::from_raw(7), None);
    }
}
