// Register-oriented drive protocol
//
// Provides:
// - Register map and value kinds
// - Frame encoders for writes, reads, discovery, sync and motion commands
// - Decoder for telemetry, status feedback, register echoes and characterization results

pub mod codec;
pub mod registers;

pub use codec::{
    DeviceId, MAX_DEVICE_ID, MotionSetpoint, ProtocolError, ProtocolEvent, RegisterValue,
    ResponseValue, decode, discovery_frame, encode_read, encode_write, motion_command_frame,
    pack_motion_setpoint, sync_frame,
};
pub use registers::{ControlMode, DriveState, PARAMETER_REGISTERS, Register, ValueKind};
