// Message types for the runtime

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_MAX_ACCELERATION, DEFAULT_MAX_VELOCITY};
use crate::drive::Device;
use crate::motion::SchedulerState;
use crate::protocol::{ControlMode, DeviceId, Register};

fn default_max_velocity() -> f64 {
    DEFAULT_MAX_VELOCITY
}

fn default_max_acceleration() -> f64 {
    DEFAULT_MAX_ACCELERATION
}

// Command from teleop/scripts -> runtime
// e.g. {"command": "move", "devices": [1, 2], "target": 3.14}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RuntimeCommand {
    Move {
        devices: Vec<DeviceId>,
        target: f64,
        #[serde(default = "default_max_velocity")]
        max_velocity: f64,
        #[serde(default = "default_max_acceleration")]
        max_acceleration: f64,
    },
    Cancel,
    Scan,
    WriteRegister {
        device: DeviceId,
        register: Register,
        value: f64,
    },
    ReadRegister {
        device: DeviceId,
        register: Register,
    },
    Enable {
        device: DeviceId,
        enabled: bool,
    },
    SetControlMode {
        device: DeviceId,
        mode: ControlMode,
    },
    SetTelemetryRate {
        device: DeviceId,
        rate_hz: u32,
    },
    Characterize {
        device: DeviceId,
        voltage: f32,
    },
    ApplyCurrentBandwidth {
        device: DeviceId,
        bandwidth_hz: f32,
    },
    RequestParameters {
        device: DeviceId,
    },
}

/// Registry snapshot published by runtime
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub link_up: bool,
    pub devices: Vec<Device>,
}

/// Scheduler health published by runtime
#[derive(Debug, Clone, Serialize)]
pub struct MotionStatus {
    pub moving: bool,
    #[serde(flatten)]
    pub state: SchedulerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move_with_defaults() {
        let cmd: RuntimeCommand =
            serde_json::from_str(r#"{"command": "move", "devices": [1, 2], "target": 3.0}"#)
                .unwrap();
        assert_eq!(
            cmd,
            RuntimeCommand::Move {
                devices: vec![1, 2],
                target: 3.0,
                max_velocity: DEFAULT_MAX_VELOCITY,
                max_acceleration: DEFAULT_MAX_ACCELERATION,
            }
        );
    }

    #[test]
    fn test_parse_register_commands() {
        let cmd: RuntimeCommand = serde_json::from_str(
            r#"{"command": "write_register", "device": 3, "register": "vel_pid_p", "value": 0.5}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            RuntimeCommand::WriteRegister {
                device: 3,
                register: Register::VelPidP,
                value: 0.5,
            }
        );

        let cmd: RuntimeCommand = serde_json::from_str(
            r#"{"command": "set_control_mode", "device": 1, "mode": "velocity"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            RuntimeCommand::SetControlMode {
                device: 1,
                mode: ControlMode::Velocity,
            }
        );

        assert!(serde_json::from_str::<RuntimeCommand>(r#"{"command": "warp"}"#).is_err());
    }

    #[test]
    fn test_motion_status_json() {
        let status = MotionStatus {
            moving: true,
            state: SchedulerState::Executing {
                index: 3,
                total: 10,
            },
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["moving"], true);
        assert_eq!(json["state"], "executing");
        assert_eq!(json["index"], 3);
    }
}
