// Registry of discovered drives and their last-known state
//
// Owned by a single writer (the ingest task); everyone else reads snapshots.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::protocol::{ControlMode, DeviceId, DriveState, ProtocolEvent, Register, ResponseValue};

/// Last-known state of one drive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub angle: f64,     // rad
    pub velocity: f64,  // rad/s
    pub current_q: f64, // A
    pub phase_resistance: f32,
    pub phase_inductance: f32,
    pub enabled: bool,
    pub control_mode: ControlMode,
    pub state: DriveState,
    pub status_flags: u8,
    /// Last echoed value of every float register, keyed by register id
    pub parameters: BTreeMap<u8, f32>,
}

impl Device {
    fn new(id: DeviceId) -> Self {
        Self {
            id,
            angle: 0.0,
            velocity: 0.0,
            current_q: 0.0,
            phase_resistance: 0.0,
            phase_inductance: 0.0,
            enabled: false,
            control_mode: ControlMode::default(),
            state: DriveState::default(),
            status_flags: 0,
            parameters: BTreeMap::new(),
        }
    }

    pub fn live_state(&self) -> LiveState {
        LiveState {
            angle: self.angle,
            velocity: self.velocity,
            current_q: self.current_q,
        }
    }

    pub fn parameter(&self, register: Register) -> Option<f32> {
        self.parameters.get(&register.id()).copied()
    }

    fn apply_response(&mut self, register: u8, value: ResponseValue) {
        match value {
            ResponseValue::Flag(enabled) if register == Register::Status.id() => {
                self.enabled = enabled;
                return;
            }
            _ => {}
        }

        let value = value.as_f32();
        self.parameters.insert(register, value);
        match Register::from_id(register) {
            Some(Register::Enable) => self.enabled = value != 0.0,
            Some(Register::ControlMode) => {
                if let Some(mode) = ControlMode::from_raw(value as u8) {
                    self.control_mode = mode;
                }
            }
            Some(Register::PhaseResistance) => self.phase_resistance = value,
            Some(Register::Inductance) => self.phase_inductance = value,
            _ => {}
        }
    }
}

/// Angle, velocity and current of one drive
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiveState {
    pub angle: f64,
    pub velocity: f64,
    pub current_q: f64,
}

/// What an event changed, for forwarding to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum RegistryChange {
    NewDevice { device_id: DeviceId },
    TelemetryUpdated { device_id: DeviceId },
    ParameterUpdated { device_id: DeviceId, register: u8 },
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, Device>,
}

/// Registry shared between the ingest task (writer) and readers
pub type SharedRegistry = Arc<RwLock<DeviceRegistry>>;

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Apply a decoded event. Creates the device on first sight.
    pub fn on_event(&mut self, event: &ProtocolEvent) -> Option<RegistryChange> {
        let device_id = event.device_id()?;
        let is_new = !self.devices.contains_key(&device_id);
        let device = self
            .devices
            .entry(device_id)
            .or_insert_with(|| Device::new(device_id));

        let change = match *event {
            ProtocolEvent::Telemetry {
                angle,
                velocity,
                current_q,
                ..
            } => {
                device.angle = angle;
                device.velocity = velocity;
                device.current_q = current_q;
                RegistryChange::TelemetryUpdated { device_id }
            }
            ProtocolEvent::StatusFeedback {
                angle,
                velocity,
                status_flags,
                state,
                ..
            } => {
                device.angle = angle;
                device.velocity = velocity;
                device.status_flags = status_flags;
                if let Some(state) = state {
                    device.state = state;
                }
                RegistryChange::TelemetryUpdated { device_id }
            }
            ProtocolEvent::RegisterResponse {
                register, value, ..
            } => {
                device.apply_response(register, value);
                RegistryChange::ParameterUpdated {
                    device_id,
                    register,
                }
            }
            ProtocolEvent::CharacterizationResponse {
                resistance,
                inductance,
                ..
            } => {
                device.phase_resistance = resistance;
                device.phase_inductance = inductance;
                device
                    .parameters
                    .insert(Register::PhaseResistance.id(), resistance);
                device
                    .parameters
                    .insert(Register::Inductance.id(), inductance);
                RegistryChange::ParameterUpdated {
                    device_id,
                    register: Register::CharacterizeMotor.id(),
                }
            }
            ProtocolEvent::Unrecognized => return None,
        };

        if is_new {
            Some(RegistryChange::NewDevice { device_id })
        } else {
            Some(change)
        }
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    pub fn live_state(&self, id: DeviceId) -> Option<LiveState> {
        self.get(id).map(Device::live_state)
    }

    /// Copy of every device, ordered by id
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget every device (rescan)
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(device_id: DeviceId, angle: f64) -> ProtocolEvent {
        ProtocolEvent::Telemetry {
            device_id,
            angle,
            velocity: 0.5,
            current_q: 0.1,
        }
    }

    #[test]
    fn test_first_frame_creates_device() {
        let mut registry = DeviceRegistry::new();
        let change = registry.on_event(&telemetry(3, 1.0));
        assert_eq!(change, Some(RegistryChange::NewDevice { device_id: 3 }));

        let device = registry.get(3).unwrap();
        assert_eq!(device.angle, 1.0);
        assert_eq!(device.velocity, 0.5);
    }

    #[test]
    fn test_rediscovery_updates_in_place() {
        let mut registry = DeviceRegistry::new();
        registry.on_event(&telemetry(3, 1.0));
        let change = registry.on_event(&telemetry(3, 2.0));

        assert_eq!(change, Some(RegistryChange::TelemetryUpdated { device_id: 3 }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_state(3).unwrap().angle, 2.0);
    }

    #[test]
    fn test_register_responses() {
        let mut registry = DeviceRegistry::new();
        registry.on_event(&telemetry(1, 0.0));

        let change = registry.on_event(&ProtocolEvent::RegisterResponse {
            device_id: 1,
            register: Register::Status.id(),
            value: ResponseValue::Flag(true),
        });
        assert_eq!(
            change,
            Some(RegistryChange::ParameterUpdated {
                device_id: 1,
                register: 0
            })
        );
        assert!(registry.get(1).unwrap().enabled);

        registry.on_event(&ProtocolEvent::RegisterResponse {
            device_id: 1,
            register: Register::ControlMode.id(),
            value: ResponseValue::Float(1.0),
        });
        registry.on_event(&ProtocolEvent::RegisterResponse {
            device_id: 1,
            register: Register::VelPidP.id(),
            value: ResponseValue::Float(0.25),
        });

        let device = registry.get(1).unwrap();
        assert_eq!(device.control_mode, ControlMode::Velocity);
        assert_eq!(device.parameter(Register::VelPidP), Some(0.25));
    }

    #[test]
    fn test_status_feedback_and_characterization() {
        let mut registry = DeviceRegistry::new();
        registry.on_event(&ProtocolEvent::StatusFeedback {
            device_id: 2,
            angle: 0.75,
            velocity: -1.0,
            status_flags: 0x01,
            state: Some(DriveState::Fault),
        });
        registry.on_event(&ProtocolEvent::CharacterizationResponse {
            device_id: 2,
            resistance: 1.2,
            inductance: 0.0005,
        });

        let device = registry.get(2).unwrap();
        assert_eq!(device.angle, 0.75);
        assert_eq!(device.state, DriveState::Fault);
        assert_eq!(device.phase_resistance, 1.2);
        assert_eq!(device.phase_inductance, 0.0005);
        assert_eq!(device.parameter(Register::PhaseResistance), Some(1.2));
    }

    #[test]
    fn test_unrecognized_is_ignored() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.on_event(&ProtocolEvent::Unrecognized), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_and_rediscover_no_duplicates() {
        let mut registry = DeviceRegistry::new();
        for _ in 0..2 {
            registry.clear();
            for id in [4, 9, 4, 9] {
                registry.on_event(&telemetry(id, 0.0));
            }
        }
        assert_eq!(registry.ids(), vec![4, 9]);
    }
}
