// High-level drive controller
//
// Wires the bus, codec, registry and scheduler together and exposes a plain
// command API. Nothing here waits for a drive to answer: reads are requests,
// and their results show up as events and registry updates.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::registry::{Device, DeviceRegistry, LiveState, RegistryChange, SharedRegistry};
use crate::bus::{BusError, CanBus, Frame, ReceiveLoop};
use crate::config::{EVENT_CHANNEL_CAPACITY, PARAMETER_REQUEST_INTERVAL, RECV_TIMEOUT};
use crate::motion::{
    MotionLimits, MoveError, MoveSummary, Scheduler, SchedulerState, SyncGroup,
};
use crate::protocol::{
    self, ControlMode, DeviceId, MAX_DEVICE_ID, PARAMETER_REGISTERS, ProtocolError, ProtocolEvent,
    Register, RegisterValue, ValueKind,
};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Move rejected: {0}")]
    Move(#[from] MoveError),

    #[error("Device {0} is not in the registry")]
    UnknownDevice(DeviceId),

    #[error("Device {0} has no characterized phase resistance and inductance")]
    NotCharacterized(DeviceId),

    #[error("Cannot move device {old} to address {new} (must be 1..=127 and different)")]
    InvalidAddress { old: DeviceId, new: DeviceId },
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Current-loop gains derived from a target bandwidth
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentGains {
    pub p: f32,
    pub i: f32,
}

impl CurrentGains {
    /// P = L * 2pi * bw, I = R * 2pi * bw
    pub fn from_bandwidth(resistance: f32, inductance: f32, bandwidth_hz: f32) -> Self {
        Self {
            p: inductance * bandwidth_hz * TAU,
            i: resistance * bandwidth_hz * TAU,
        }
    }
}

/// Typed register value for a numeric input, following the register's wire type
pub fn register_value(register: Register, value: f64) -> RegisterValue {
    match register.kind() {
        ValueKind::Byte => RegisterValue::Byte(value.round().clamp(0.0, 255.0) as u8),
        ValueKind::Float32 => RegisterValue::Float(value as f32),
        ValueKind::Uint32 => RegisterValue::Uint(value.round().clamp(0.0, u32::MAX as f64) as u32),
        ValueKind::None => RegisterValue::None,
    }
}

/// Telemetry period in microseconds for a rate in Hz (0 disables)
pub fn telemetry_period_us(rate_hz: u32) -> u32 {
    if rate_hz == 0 { 0 } else { 1_000_000 / rate_hz }
}

pub struct DriveController {
    bus: Arc<dyn CanBus>,
    registry: SharedRegistry,
    events: broadcast::Sender<ProtocolEvent>,
    changes: broadcast::Sender<RegistryChange>,
    scheduler: Scheduler,
    receiver: ReceiveLoop,
    ingest: JoinHandle<()>,
}

impl DriveController {
    /// Start receiving on `bus`. Must be called within a tokio runtime.
    pub fn start(bus: Arc<dyn CanBus>) -> Result<Self> {
        Self::start_with_timeout(bus, RECV_TIMEOUT)
    }

    pub fn start_with_timeout(bus: Arc<dyn CanBus>, recv_timeout: Duration) -> Result<Self> {
        let registry = DeviceRegistry::shared();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let (receiver, frames) = ReceiveLoop::spawn(bus.clone(), recv_timeout)?;
        let scheduler = Scheduler::new(bus.clone(), registry.clone(), receiver.link_up());
        let ingest = tokio::spawn(ingest(
            frames,
            registry.clone(),
            events.clone(),
            changes.clone(),
        ));

        info!("Drive controller started");
        Ok(Self {
            bus,
            registry,
            events,
            changes,
            scheduler,
            receiver,
            ingest,
        })
    }

    // === Raw register access ===

    pub fn send_register(
        &self,
        device_id: DeviceId,
        register: Register,
        value: RegisterValue,
    ) -> Result<()> {
        let frame = protocol::encode_write(device_id, register, value)?;
        debug!("Write {:?} = {:?} to device {}", register, value, device_id);
        self.bus.send(&frame)?;
        Ok(())
    }

    /// Ask a drive to echo a register; the answer arrives as an event
    pub fn request_register(&self, device_id: DeviceId, register: Register) -> Result<()> {
        let frame = protocol::encode_read(device_id, register)?;
        trace!("Read {:?} from device {}", register, device_id);
        self.bus.send(&frame)?;
        Ok(())
    }

    // === Observation ===

    pub fn read_live_state(&self, device_id: DeviceId) -> Option<LiveState> {
        self.registry().live_state(device_id)
    }

    pub fn device(&self, device_id: DeviceId) -> Option<Device> {
        self.registry().get(device_id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry().snapshot()
    }

    /// Every decoded event from now on. Slow receivers skip the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    /// False once the receive loop has seen a bus fault.
    ///
    /// Terminal: the receive loop exits on the first fault and every later
    /// move fails to arm. Drop this controller and start a new one over a
    /// reopened bus to recover.
    pub fn link_up(&self) -> bool {
        self.receiver
            .link_up()
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Forget every known drive and broadcast a discovery request
    pub fn scan(&self) -> Result<()> {
        info!("Scanning bus for drives");
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.bus.send(&protocol::discovery_frame())?;
        Ok(())
    }

    // === Drive commands ===

    pub fn enable(&self, device_id: DeviceId, enabled: bool) -> Result<()> {
        info!(
            "{} device {}",
            if enabled { "Enabling" } else { "Disabling" },
            device_id
        );
        self.send_register(
            device_id,
            Register::Enable,
            RegisterValue::Byte(u8::from(enabled)),
        )
    }

    pub fn set_control_mode(&self, device_id: DeviceId, mode: ControlMode) -> Result<()> {
        info!("Setting device {} to {:?} control", device_id, mode);
        self.send_register(
            device_id,
            Register::ControlMode,
            RegisterValue::Byte(mode as u8),
        )
    }

    pub fn set_target(&self, device_id: DeviceId, target: f32) -> Result<()> {
        self.send_register(device_id, Register::Target, RegisterValue::Float(target))
    }

    pub fn set_telemetry_rate(&self, device_id: DeviceId, rate_hz: u32) -> Result<()> {
        info!("Setting device {} telemetry to {} Hz", device_id, rate_hz);
        self.send_register(
            device_id,
            Register::TelemetryPeriod,
            RegisterValue::Uint(telemetry_period_us(rate_hz)),
        )
    }

    /// Start the firmware's resistance/inductance measurement at `voltage`
    pub fn request_characterization(&self, device_id: DeviceId, voltage: f32) -> Result<()> {
        info!("Characterizing device {} at {} V", device_id, voltage);
        self.send_register(
            device_id,
            Register::CharacterizeMotor,
            RegisterValue::Float(voltage),
        )
    }

    pub fn flip_sensor_direction(&self, device_id: DeviceId) -> Result<()> {
        info!("Flipping sensor direction on device {}", device_id);
        self.send_register(
            device_id,
            Register::FlipSensorDirection,
            RegisterValue::Byte(1),
        )
    }

    pub fn restart(&self, device_id: DeviceId) -> Result<()> {
        info!("Restarting device {}", device_id);
        self.send_register(device_id, Register::Restart, RegisterValue::None)
    }

    /// Give a drive a new bus address. Takes effect after a restart.
    pub fn change_address(&self, old: DeviceId, new: DeviceId) -> Result<()> {
        if new == 0 || new > MAX_DEVICE_ID || new == old {
            return Err(ControllerError::InvalidAddress { old, new });
        }
        info!("Moving device {} to address {} (applies on restart)", old, new);
        self.send_register(old, Register::MotorAddress, RegisterValue::Byte(new))
    }

    /// Request every tunable parameter, spaced out so the drive can keep up
    pub async fn request_all_parameters(&self, device_id: DeviceId) -> Result<()> {
        info!("Requesting all parameters from device {}", device_id);
        for register in PARAMETER_REGISTERS {
            self.request_register(device_id, register)?;
            tokio::time::sleep(PARAMETER_REQUEST_INTERVAL).await;
        }
        Ok(())
    }

    /// Set both current loops for `bandwidth_hz` from the characterized R and L
    pub fn apply_current_bandwidth(
        &self,
        device_id: DeviceId,
        bandwidth_hz: f32,
    ) -> Result<CurrentGains> {
        let (resistance, inductance) = {
            let registry = self.registry();
            let device = registry
                .get(device_id)
                .ok_or(ControllerError::UnknownDevice(device_id))?;
            (device.phase_resistance, device.phase_inductance)
        };
        if resistance <= 0.0 || inductance <= 0.0 {
            return Err(ControllerError::NotCharacterized(device_id));
        }

        let gains = CurrentGains::from_bandwidth(resistance, inductance, bandwidth_hz);
        info!(
            "Device {} current bandwidth {} Hz: P={:.4}, I={:.4}",
            device_id, bandwidth_hz, gains.p, gains.i
        );
        for (register, value) in [
            (Register::CurqPidP, gains.p),
            (Register::CurqPidI, gains.i),
            (Register::CurdPidP, gains.p),
            (Register::CurdPidI, gains.i),
        ] {
            self.send_register(device_id, register, RegisterValue::Float(value))?;
        }
        Ok(gains)
    }

    // === Motion ===

    /// Plan and stream a synchronized move with default jerk and sample period
    pub fn plan_and_execute(
        &self,
        group: &[DeviceId],
        target: f64,
        max_velocity: f64,
        max_acceleration: f64,
    ) -> Result<MoveSummary> {
        self.plan_and_execute_with_limits(
            group,
            target,
            &MotionLimits::new(max_velocity, max_acceleration),
        )
    }

    pub fn plan_and_execute_with_limits(
        &self,
        group: &[DeviceId],
        target: f64,
        limits: &MotionLimits,
    ) -> Result<MoveSummary> {
        let group = SyncGroup::new(group.iter().copied())?;
        Ok(self.scheduler.plan_and_execute(&group, target, limits)?)
    }

    pub fn is_moving(&self) -> bool {
        self.scheduler.is_moving()
    }

    pub fn cancel(&self) -> bool {
        self.scheduler.cancel()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub async fn wait_for_move(&self) {
        self.scheduler.wait_idle().await;
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, DeviceRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DriveController {
    fn drop(&mut self) {
        if self.scheduler.cancel() {
            info!("Controller dropped mid-move, holding drives");
        }
        self.receiver.stop();
        self.ingest.abort();
    }
}

/// Single writer for the registry: decode, apply, fan out
async fn ingest(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    registry: SharedRegistry,
    events: broadcast::Sender<ProtocolEvent>,
    changes: broadcast::Sender<RegistryChange>,
) {
    while let Some(frame) = frames.recv().await {
        let event = protocol::decode(&frame);
        if event == ProtocolEvent::Unrecognized {
            trace!("Dropping unrecognized frame {:?}", frame);
            continue;
        }

        let change = registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .on_event(&event);

        // No subscribers is fine
        let _ = events.send(event);
        if let Some(change) = change {
            if let RegistryChange::NewDevice { device_id } = change {
                info!("Discovered device {}", device_id);
            }
            let _ = changes.send(change);
        }
    }
    debug!("Ingest task stopped");
}
