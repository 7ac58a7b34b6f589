// Zenoh service loop
//
// Drains JSON commands from the command topic, applies them to the drive
// controller, and publishes registry snapshots and scheduler state at LOOP_HZ.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{LOOP_HZ, TOPIC_CMD, TOPIC_DEVICES, TOPIC_MOTION};
use crate::drive::controller::{self, DriveController};
use crate::messages::{DeviceSnapshot, MotionStatus, RuntimeCommand};

pub struct Runtime {
    controller: Arc<DriveController>,
}

impl Runtime {
    pub fn new(controller: Arc<DriveController>) -> Self {
        Self { controller }
    }

    /// Apply one command. Failures are reported to the caller, never fatal.
    pub fn on_command(&self, cmd: RuntimeCommand) -> controller::Result<()> {
        info!("Received command: {:?}", &cmd);
        let drives = &self.controller;
        match cmd {
            RuntimeCommand::Move {
                devices,
                target,
                max_velocity,
                max_acceleration,
            } => {
                drives.plan_and_execute(&devices, target, max_velocity, max_acceleration)?;
            }
            RuntimeCommand::Cancel => {
                if !drives.cancel() {
                    info!("Cancel ignored, nothing is moving");
                }
            }
            RuntimeCommand::Scan => drives.scan()?,
            RuntimeCommand::WriteRegister {
                device,
                register,
                value,
            } => drives.send_register(
                device,
                register,
                controller::register_value(register, value),
            )?,
            RuntimeCommand::ReadRegister { device, register } => {
                drives.request_register(device, register)?
            }
            RuntimeCommand::Enable { device, enabled } => drives.enable(device, enabled)?,
            RuntimeCommand::SetControlMode { device, mode } => {
                drives.set_control_mode(device, mode)?
            }
            RuntimeCommand::SetTelemetryRate { device, rate_hz } => {
                drives.set_telemetry_rate(device, rate_hz)?
            }
            RuntimeCommand::Characterize { device, voltage } => {
                drives.request_characterization(device, voltage)?
            }
            RuntimeCommand::ApplyCurrentBandwidth {
                device,
                bandwidth_hz,
            } => {
                drives.apply_current_bandwidth(device, bandwidth_hz)?;
            }
            RuntimeCommand::RequestParameters { device } => {
                // Paced reads take over a second; keep the loop running meanwhile
                let drives = drives.clone();
                tokio::spawn(async move {
                    if let Err(e) = drives.request_all_parameters(device).await {
                        warn!("Parameter request for device {} failed: {}", device, e);
                    }
                });
            }
        }
        Ok(())
    }

    pub fn device_snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            link_up: self.controller.link_up(),
            devices: self.controller.devices(),
        }
    }

    pub fn motion_status(&self) -> MotionStatus {
        MotionStatus {
            moving: self.controller.is_moving(),
            state: self.controller.scheduler_state(),
        }
    }
}

pub async fn run(
    controller: Arc<DriveController>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_devices = session.declare_publisher(TOPIC_DEVICES).await?;
    let pub_motion = session.declare_publisher(TOPIC_MOTION).await?;

    let runtime = Runtime::new(controller);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));

    info!("Runtime started: {}Hz loop", LOOP_HZ);
    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}, {}", TOPIC_DEVICES, TOPIC_MOTION);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                if runtime.controller.cancel() {
                    runtime.controller.wait_for_move().await;
                }
                return Ok(());
            }
        }

        // 1. Drain all pending commands (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<RuntimeCommand>(&payload) {
                Ok(cmd) => {
                    if let Err(e) = runtime.on_command(cmd) {
                        warn!("Command failed: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        // 2. Publish registry snapshot
        let devices_json = serde_json::to_string(&runtime.device_snapshot())?;
        pub_devices.put(devices_json).await?;

        // 3. Publish scheduler state
        let motion_json = serde_json::to_string(&runtime.motion_status())?;
        pub_motion.put(motion_json).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::drive::SimulatedDrives;
    use crate::protocol::{ControlMode, Register};

    fn runtime(ids: &[u8]) -> (Arc<LoopbackBus>, Runtime) {
        let bus = Arc::new(LoopbackBus::with_responder(SimulatedDrives::new(
            ids.iter().copied(),
        )));
        let controller =
            DriveController::start_with_timeout(bus.clone(), Duration::from_millis(5)).unwrap();
        (bus, Runtime::new(Arc::new(controller)))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_scan_command_fills_snapshot() {
        let (_bus, runtime) = runtime(&[3, 4]);
        runtime.on_command(RuntimeCommand::Scan).unwrap();
        settle().await;

        let snapshot = runtime.device_snapshot();
        assert!(snapshot.link_up);
        let ids: Vec<_> = snapshot.devices.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![3, 4]);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["devices"][0]["id"], 3);
    }

    #[tokio::test]
    async fn test_register_commands_reach_the_bus() {
        let (bus, runtime) = runtime(&[1]);
        runtime
            .on_command(RuntimeCommand::WriteRegister {
                device: 1,
                register: Register::Enable,
                value: 1.0,
            })
            .unwrap();
        assert_eq!(bus.sent().last().unwrap().payload(), &[0x04, 1]);

        runtime
            .on_command(RuntimeCommand::SetControlMode {
                device: 1,
                mode: ControlMode::Torque,
            })
            .unwrap();
        assert_eq!(bus.sent().last().unwrap().payload(), &[0x05, 0]);
    }

    #[tokio::test]
    async fn test_move_and_cancel() {
        let (_bus, runtime) = runtime(&[1]);
        runtime.on_command(RuntimeCommand::Scan).unwrap();
        settle().await;

        runtime
            .on_command(RuntimeCommand::Move {
                devices: vec![1],
                target: 20.0,
                max_velocity: 5.0,
                max_acceleration: 20.0,
            })
            .unwrap();
        assert!(runtime.motion_status().moving);

        runtime.on_command(RuntimeCommand::Cancel).unwrap();
        runtime.controller.wait_for_move().await;
        assert!(!runtime.motion_status().moving);
    }

    #[tokio::test]
    async fn test_failed_command_is_reported() {
        let (_bus, runtime) = runtime(&[]);
        let result = runtime.on_command(RuntimeCommand::Move {
            devices: vec![9],
            target: 1.0,
            max_velocity: 5.0,
            max_acceleration: 20.0,
        });
        assert!(result.is_err());
        assert!(!runtime.motion_status().moving);
    }
}
