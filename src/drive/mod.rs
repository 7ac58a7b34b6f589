// Drive-side state and control
//
// Provides:
// - Registry of discovered drives and their last-known state
// - Controller: register commands, discovery, synchronized moves
// - Simulated drives answering on a loopback bus

pub mod controller;
pub mod registry;
pub mod simulator;

pub use controller::{ControllerError, CurrentGains, DriveController};
pub use registry::{Device, DeviceRegistry, LiveState, RegistryChange, SharedRegistry};
pub use simulator::SimulatedDrives;
