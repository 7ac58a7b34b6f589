// Synchronized multi-axis execution
//
// Idle -> Planning -> Armed -> Executing -> Complete -> Idle
//
// Planning and arming run synchronously inside `plan_and_execute`, so every
// rejection is reported before the call returns. Execution is a tokio task
// paced by an interval: each tick sends at most one due point, packed once and
// sent to every member of the group. Open loop: positions are never corrected
// from feedback.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::planner::{MotionLimits, PlanError, ProfileKind, Trajectory, plan};
use crate::bus::{BusError, CanBus};
use crate::config::TICK_PERIOD;
use crate::drive::registry::SharedRegistry;
use crate::protocol::{
    self, DeviceId, MAX_DEVICE_ID, MotionSetpoint, ProtocolError, Register, RegisterValue,
};

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error("Move already in progress")]
    MoveInProgress,

    #[error("Sync group is empty")]
    EmptyGroup,

    #[error("Device {0} is not in the registry")]
    StaleDevice(DeviceId),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Planning rejected: {0}")]
    Plan(#[from] PlanError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, MoveError>;

/// Why the last move ended in `Error`
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum MoveFault {
    #[error("plan rejected: {0}")]
    Plan(String),

    #[error("device {0} went stale")]
    StaleDevice(DeviceId),

    #[error("transport fault: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Planning,
    Armed,
    /// `index` points sent out of `total`
    Executing { index: usize, total: usize },
    Complete,
    Error { fault: MoveFault },
}

impl SchedulerState {
    /// True from Planning until the move is back to Idle or Error
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Armed | Self::Executing { .. } | Self::Complete
        )
    }
}

/// Ordered, duplicate-free, non-empty set of drives moving in lockstep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroup {
    members: Vec<DeviceId>,
}

impl SyncGroup {
    /// Keeps first-seen order and drops repeats
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Result<Self> {
        let mut members = Vec::new();
        for id in ids {
            if id > MAX_DEVICE_ID {
                return Err(ProtocolError::InvalidDeviceId(id).into());
            }
            if !members.contains(&id) {
                members.push(id);
            }
        }
        if members.is_empty() {
            return Err(MoveError::EmptyGroup);
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }

    /// Member whose position the plan starts from
    pub fn leader(&self) -> DeviceId {
        self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Never true for a constructed group
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// What was accepted for execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveSummary {
    pub kind: ProfileKind,
    pub points: usize,
    pub duration: f64,
    pub start: f64,
    pub target: f64,
}

pub struct Scheduler {
    bus: Arc<dyn CanBus>,
    registry: SharedRegistry,
    link_up: Arc<AtomicBool>,
    state: Arc<watch::Sender<SchedulerState>>,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(bus: Arc<dyn CanBus>, registry: SharedRegistry, link_up: Arc<AtomicBool>) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            bus,
            registry,
            link_up,
            state: Arc::new(state),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn is_moving(&self) -> bool {
        self.state.borrow().is_active()
    }

    /// Wait until the current move (if any) has finished or failed
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|state| !state.is_active()).await;
    }

    /// Ask the running move to stop. Returns false if nothing is moving.
    pub fn cancel(&self) -> bool {
        if !self.is_moving() {
            return false;
        }
        info!("Cancelling move");
        self.cancel.store(true, Ordering::Release);
        true
    }

    /// Plan a move for `group` to `target`, arm the drives and start streaming.
    ///
    /// Returns once execution has started; must be called within a tokio runtime.
    /// Pre-flight rejections (move in progress, stale member) leave the state
    /// untouched and send nothing. A rejected plan leaves the scheduler in
    /// `Error` without sending anything.
    pub fn plan_and_execute(
        &self,
        group: &SyncGroup,
        target: f64,
        limits: &MotionLimits,
    ) -> Result<MoveSummary> {
        if self.is_moving() {
            return Err(MoveError::MoveInProgress);
        }

        let start = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            if let Some(&id) = group.members().iter().find(|&&id| !registry.contains(id)) {
                return Err(MoveError::StaleDevice(id));
            }
            registry
                .live_state(group.leader())
                .map_or(0.0, |state| state.angle)
        };

        // Claim the scheduler; a concurrent caller may have won since the check above
        let claimed = self.state.send_if_modified(|state| {
            if state.is_active() {
                return false;
            }
            *state = SchedulerState::Planning;
            true
        });
        if !claimed {
            return Err(MoveError::MoveInProgress);
        }
        self.cancel.store(false, Ordering::Release);

        let trajectory = match plan(start, target, limits) {
            Ok(trajectory) => trajectory,
            Err(e) => {
                warn!("Plan rejected: {}", e);
                self.state.send_replace(SchedulerState::Error {
                    fault: MoveFault::Plan(e.to_string()),
                });
                return Err(e.into());
            }
        };

        self.state.send_replace(SchedulerState::Armed);
        if let Err(e) = self.arm(group, start) {
            error!("Arming failed: {}", e);
            self.state.send_replace(SchedulerState::Error {
                fault: MoveFault::Transport(e.to_string()),
            });
            return Err(e);
        }
        let started = Instant::now();

        let summary = MoveSummary {
            kind: trajectory.kind(),
            points: trajectory.len(),
            duration: trajectory.duration(),
            start,
            target,
        };
        info!(
            "Executing {:?} move for {:?}: {:.4} -> {:.4}, {} points over {:.3}s",
            summary.kind,
            group.members(),
            start,
            target,
            summary.points,
            summary.duration
        );

        self.state.send_replace(SchedulerState::Executing {
            index: 0,
            total: trajectory.len(),
        });
        let execution = Execution {
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            link_up: self.link_up.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            group: group.clone(),
            trajectory,
            start,
            started,
        };
        tokio::spawn(execution.run());

        Ok(summary)
    }

    /// Enable every member, then release the sync barrier.
    ///
    /// A send failure partway through pins the whole group at `start`.
    fn arm(&self, group: &SyncGroup, start: f64) -> Result<()> {
        if !self.link_up.load(Ordering::Acquire) {
            return Err(BusError::Disconnected.into());
        }
        let armed = group
            .members()
            .iter()
            .try_for_each(|&id| {
                let frame = protocol::encode_write(id, Register::Enable, RegisterValue::Byte(1))?;
                self.bus.send(&frame).map_err(MoveError::from)
            })
            .and_then(|()| self.bus.send(&protocol::sync_frame()).map_err(MoveError::from));
        if armed.is_err() {
            hold_group(self.bus.as_ref(), group, start);
        } else {
            debug!("Sync barrier sent to {:?}", group.members());
        }
        armed
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // The execution task holds its own handles; make it hold and exit
        if self.is_moving() {
            self.cancel.store(true, Ordering::Release);
        }
    }
}

/// Send one packed setpoint to every member
fn send_to_group(bus: &dyn CanBus, group: &SyncGroup, payload: &[u8; 8]) -> Result<()> {
    for &id in group.members() {
        bus.send(&protocol::motion_command_frame(id, payload)?)?;
    }
    Ok(())
}

/// Best-effort: pin every member at `position`, ignoring send failures
fn hold_group(bus: &dyn CanBus, group: &SyncGroup, position: f64) {
    let payload = pinned(position);
    for &id in group.members() {
        let sent = protocol::motion_command_frame(id, &payload)
            .map_err(MoveError::from)
            .and_then(|frame| bus.send(&frame).map_err(MoveError::from));
        if let Err(e) = sent {
            warn!("Hold command to device {} failed: {}", id, e);
        }
    }
}

fn pinned(position: f64) -> [u8; 8] {
    protocol::pack_motion_setpoint(&MotionSetpoint {
        position,
        velocity: 0.0,
        acceleration: 0.0,
    })
}

/// State owned by one running move
struct Execution {
    bus: Arc<dyn CanBus>,
    registry: SharedRegistry,
    link_up: Arc<AtomicBool>,
    state: Arc<watch::Sender<SchedulerState>>,
    cancel: Arc<AtomicBool>,
    group: SyncGroup,
    trajectory: Trajectory,
    start: f64,
    started: Instant,
}

impl Execution {
    async fn run(self) {
        let points = self.trajectory.points();
        let total = points.len();
        let mut next = 0;
        let mut last_position = self.start;

        let mut tick = interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if self.cancel.swap(false, Ordering::AcqRel) {
                info!("Move cancelled at point {}/{}", next, total);
                self.hold(last_position);
                self.state.send_replace(SchedulerState::Idle);
                return;
            }
            if !self.link_up.load(Ordering::Acquire) {
                self.abort(last_position, MoveFault::Transport("link down".into()));
                return;
            }
            if let Some(id) = self.stale_member() {
                self.abort(last_position, MoveFault::StaleDevice(id));
                return;
            }

            // The final pin gets a tick of its own, after the last point
            if next == total {
                let target = self.trajectory.target();
                if let Err(e) = send_to_group(self.bus.as_ref(), &self.group, &pinned(target)) {
                    self.abort(last_position, MoveFault::Transport(e.to_string()));
                    return;
                }
                self.state.send_replace(SchedulerState::Complete);
                info!(
                    "Move complete: {:?} at {:.4}",
                    self.group.members(),
                    target
                );
                self.state.send_replace(SchedulerState::Idle);
                return;
            }

            let elapsed = self.started.elapsed().as_secs_f64();
            if let Some(point) = points.get(next).filter(|point| point.t <= elapsed) {
                let payload = protocol::pack_motion_setpoint(&point.setpoint());
                if let Err(e) = send_to_group(self.bus.as_ref(), &self.group, &payload) {
                    self.abort(last_position, MoveFault::Transport(e.to_string()));
                    return;
                }
                last_position = point.position;
                next += 1;
                self.state
                    .send_replace(SchedulerState::Executing { index: next, total });
            }
        }
    }

    fn stale_member(&self) -> Option<DeviceId> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        self.group
            .members()
            .iter()
            .copied()
            .find(|&id| !registry.contains(id))
    }

    fn hold(&self, position: f64) {
        hold_group(self.bus.as_ref(), &self.group, position);
    }

    fn abort(&self, position: f64, fault: MoveFault) {
        error!("Move aborted: {}", fault);
        self.hold(position);
        self.state.send_replace(SchedulerState::Error { fault });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Frame, LoopbackBus};
    use crate::drive::registry::DeviceRegistry;
    use crate::protocol::ProtocolEvent;
    use crate::protocol::codec::decode_motion_command;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Rig {
        bus: Arc<LoopbackBus>,
        registry: SharedRegistry,
        link_up: Arc<AtomicBool>,
        scheduler: Scheduler,
    }

    fn registry_of(ids: &[DeviceId]) -> SharedRegistry {
        let registry = DeviceRegistry::shared();
        {
            let mut registry = registry.write().unwrap();
            for &device_id in ids {
                registry.on_event(&ProtocolEvent::Telemetry {
                    device_id,
                    angle: 0.0,
                    velocity: 0.0,
                    current_q: 0.0,
                });
            }
        }
        registry
    }

    fn rig(ids: &[DeviceId]) -> Rig {
        let bus = Arc::new(LoopbackBus::new());
        let registry = registry_of(ids);
        let link_up = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new(bus.clone(), registry.clone(), link_up.clone());
        Rig {
            bus,
            registry,
            link_up,
            scheduler,
        }
    }

    /// Motion payloads sent to `id`, in order
    fn motion_payloads(sent: &[Frame], id: DeviceId) -> Vec<Vec<u8>> {
        sent.iter()
            .filter(|f| matches!(decode_motion_command(f), Some((d, _)) if d == id))
            .map(|f| f.payload().to_vec())
            .collect()
    }

    fn last_setpoint(sent: &[Frame]) -> MotionSetpoint {
        let frame = sent.last().unwrap();
        decode_motion_command(frame).unwrap().1
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_moves_in_lockstep() {
        let rig = rig(&[1, 2]);
        let group = SyncGroup::new([1, 2]).unwrap();
        let summary = rig
            .scheduler
            .plan_and_execute(&group, 1.0, &MotionLimits::new(5.0, 20.0))
            .unwrap();
        rig.scheduler.wait_idle().await;
        assert_eq!(rig.scheduler.state(), SchedulerState::Idle);

        let sent = rig.bus.sent();
        let enable = |id| protocol::encode_write(id, Register::Enable, RegisterValue::Byte(1)).unwrap();
        assert_eq!(sent[0], enable(1));
        assert_eq!(sent[1], enable(2));
        assert_eq!(sent[2], protocol::sync_frame());

        // Every point plus the final pin, bit-identical across members
        let first = motion_payloads(&sent, 1);
        let second = motion_payloads(&sent, 2);
        assert_eq!(first.len(), summary.points + 1);
        assert_eq!(first, second);

        // Members alternate: one frame per device per point
        for pair in sent[3..].chunks(2) {
            assert_eq!(pair[0].payload(), pair[1].payload());
        }

        let end = last_setpoint(&sent);
        assert_eq!(end.position, 1.0);
        assert_eq!(end.velocity, 0.0);
        assert_eq!(end.acceleration, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_points_follow_wall_clock() {
        let rig = rig(&[3]);
        let group = SyncGroup::new([3]).unwrap();
        let summary = rig
            .scheduler
            .plan_and_execute(&group, 10.0, &MotionLimits::new(5.0, 20.0))
            .unwrap();
        assert_eq!(summary.kind, ProfileKind::SCurve);

        tokio::time::sleep(Duration::from_millis(502)).await;
        match rig.scheduler.state() {
            // Points at 0, 5, ..., 500 ms are due, give or take one tick
            SchedulerState::Executing { index, total } => {
                assert!((100..=102).contains(&index), "index {}", index);
                assert_eq!(total, summary.points);
            }
            other => panic!("unexpected state {:?}", other),
        }

        rig.scheduler.wait_idle().await;
        assert_eq!(
            motion_payloads(&rig.bus.sent(), 3).len(),
            summary.points + 1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_rejections_send_nothing() {
        let rig = rig(&[1]);
        let limits = MotionLimits::new(5.0, 20.0);

        assert!(matches!(
            SyncGroup::new(Vec::new()),
            Err(MoveError::EmptyGroup)
        ));
        assert!(matches!(
            SyncGroup::new([1, 200]),
            Err(MoveError::Protocol(ProtocolError::InvalidDeviceId(200)))
        ));

        let group = SyncGroup::new([1, 9]).unwrap();
        assert!(matches!(
            rig.scheduler.plan_and_execute(&group, 1.0, &limits),
            Err(MoveError::StaleDevice(9))
        ));
        assert_eq!(rig.scheduler.state(), SchedulerState::Idle);
        assert!(rig.bus.sent().is_empty());
    }

    #[test]
    fn test_sync_group_dedups_in_order() {
        let group = SyncGroup::new([4, 2, 4, 7, 2]).unwrap();
        assert_eq!(group.members(), &[4, 2, 7]);
        assert_eq!(group.leader(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_move_rejected_while_executing() {
        let rig = rig(&[1, 2]);
        let limits = MotionLimits::new(5.0, 20.0);
        rig.scheduler
            .plan_and_execute(&SyncGroup::new([1]).unwrap(), 10.0, &limits)
            .unwrap();

        let sent_before = rig.bus.sent().len();
        assert!(matches!(
            rig.scheduler
                .plan_and_execute(&SyncGroup::new([2]).unwrap(), 5.0, &limits),
            Err(MoveError::MoveInProgress)
        ));
        assert_eq!(rig.bus.sent().len(), sent_before);
        assert!(rig.scheduler.is_moving());

        rig.scheduler.cancel();
        rig.scheduler.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_plan_enters_error_then_recovers() {
        let rig = rig(&[1]);
        let group = SyncGroup::new([1]).unwrap();

        let result = rig
            .scheduler
            .plan_and_execute(&group, 1.0, &MotionLimits::new(0.0, 20.0));
        assert!(matches!(result, Err(MoveError::Plan(PlanError::InvalidVelocity(_)))));
        assert!(matches!(
            rig.scheduler.state(),
            SchedulerState::Error {
                fault: MoveFault::Plan(_)
            }
        ));
        assert!(rig.bus.sent().is_empty());

        // Error accepts a new request
        rig.scheduler
            .plan_and_execute(&group, 0.5, &MotionLimits::new(5.0, 20.0))
            .unwrap();
        rig.scheduler.wait_idle().await;
        assert_eq!(rig.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_holds_last_position() {
        let rig = rig(&[1, 2]);
        let group = SyncGroup::new([1, 2]).unwrap();
        rig.scheduler
            .plan_and_execute(&group, 10.0, &MotionLimits::new(5.0, 20.0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rig.scheduler.cancel());
        rig.scheduler.wait_idle().await;
        assert_eq!(rig.scheduler.state(), SchedulerState::Idle);
        assert!(!rig.scheduler.cancel());

        let payloads = motion_payloads(&rig.bus.sent(), 1);
        let hold = &payloads[payloads.len() - 1];
        let previous = &payloads[payloads.len() - 2];
        assert_eq!(&hold[..4], &previous[..4]);
        assert_eq!(&hold[4..], &[0; 4]);

        let setpoint = last_setpoint(&rig.bus.sent());
        assert!(setpoint.position > 0.0 && setpoint.position < 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_member_aborts_group() {
        let rig = rig(&[1, 2]);
        let group = SyncGroup::new([1, 2]).unwrap();
        rig.scheduler
            .plan_and_execute(&group, 10.0, &MotionLimits::new(5.0, 20.0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.registry.write().unwrap().clear();
        rig.scheduler.wait_idle().await;

        assert_eq!(
            rig.scheduler.state(),
            SchedulerState::Error {
                fault: MoveFault::StaleDevice(1)
            }
        );
        // Both members got the hold
        let sent = rig.bus.sent();
        for id in [1, 2] {
            let payloads = motion_payloads(&sent, id);
            assert_eq!(&payloads[payloads.len() - 1][4..], &[0; 4]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_aborts_move() {
        let rig = rig(&[1]);
        let group = SyncGroup::new([1]).unwrap();
        rig.scheduler
            .plan_and_execute(&group, 10.0, &MotionLimits::new(5.0, 20.0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.link_up.store(false, Ordering::Release);
        rig.scheduler.wait_idle().await;

        assert!(matches!(
            rig.scheduler.state(),
            SchedulerState::Error {
                fault: MoveFault::Transport(_)
            }
        ));
        assert_eq!(last_setpoint(&rig.bus.sent()).velocity, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_aborts_move() {
        let rig = rig(&[1]);
        let group = SyncGroup::new([1]).unwrap();
        rig.scheduler
            .plan_and_execute(&group, 10.0, &MotionLimits::new(5.0, 20.0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.bus.disconnect();
        rig.scheduler.wait_idle().await;

        assert!(matches!(
            rig.scheduler.state(),
            SchedulerState::Error {
                fault: MoveFault::Transport(_)
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arming_fails_when_link_down() {
        let rig = rig(&[1]);
        rig.link_up.store(false, Ordering::Release);
        let result = rig.scheduler.plan_and_execute(
            &SyncGroup::new([1]).unwrap(),
            1.0,
            &MotionLimits::new(5.0, 20.0),
        );
        assert!(matches!(result, Err(MoveError::Bus(BusError::Disconnected))));
        assert!(rig.bus.sent().is_empty());
    }

    /// Records the paused-clock instant of every send
    #[derive(Default)]
    struct TimedBus {
        sent: Mutex<Vec<(Instant, Frame)>>,
    }

    impl CanBus for TimedBus {
        fn send(&self, frame: &Frame) -> crate::bus::Result<()> {
            self.sent.lock().unwrap().push((Instant::now(), *frame));
            Ok(())
        }

        fn recv(&self, _timeout: Duration) -> crate::bus::Result<Option<Frame>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_motion_frame_per_device_per_tick() {
        let bus = Arc::new(TimedBus::default());
        let scheduler = Scheduler::new(
            bus.clone(),
            registry_of(&[1]),
            Arc::new(AtomicBool::new(true)),
        );
        let summary = scheduler
            .plan_and_execute(&SyncGroup::new([1]).unwrap(), 0.5, &MotionLimits::new(5.0, 20.0))
            .unwrap();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let motion: Vec<_> = bus
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, frame)| decode_motion_command(frame).is_some())
            .cloned()
            .collect();
        assert_eq!(motion.len(), summary.points + 1);
        for pair in motion.windows(2) {
            assert!(
                pair[1].0 > pair[0].0,
                "{:?} and {:?} went out in the same tick",
                pair[0].1,
                pair[1].1
            );
        }

        let (_, pin) = &motion[motion.len() - 1];
        assert_eq!(pin.payload(), &pinned(0.5));
    }

    /// Fails exactly one send, by position, and records the others
    struct FlakyBus {
        fail_at: usize,
        attempts: AtomicUsize,
        sent: Mutex<Vec<Frame>>,
    }

    impl FlakyBus {
        fn failing_at(fail_at: usize) -> Self {
            Self {
                fail_at,
                attempts: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl CanBus for FlakyBus {
        fn send(&self, frame: &Frame) -> crate::bus::Result<()> {
            if self.attempts.fetch_add(1, Ordering::AcqRel) == self.fail_at {
                return Err(BusError::Disconnected);
            }
            self.sent.lock().unwrap().push(*frame);
            Ok(())
        }

        fn recv(&self, _timeout: Duration) -> crate::bus::Result<Option<Frame>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_arming_fault_holds_group() {
        // Both enables go out, the sync barrier fails
        let bus = Arc::new(FlakyBus::failing_at(2));
        let scheduler = Scheduler::new(
            bus.clone(),
            registry_of(&[1, 2]),
            Arc::new(AtomicBool::new(true)),
        );
        let result = scheduler.plan_and_execute(
            &SyncGroup::new([1, 2]).unwrap(),
            1.0,
            &MotionLimits::new(5.0, 20.0),
        );
        assert!(matches!(result, Err(MoveError::Bus(BusError::Disconnected))));
        assert!(matches!(
            scheduler.state(),
            SchedulerState::Error {
                fault: MoveFault::Transport(_)
            }
        ));

        let sent = bus.sent.lock().unwrap().clone();
        assert!(!sent.contains(&protocol::sync_frame()));
        for id in [1, 2] {
            let holds: Vec<_> = sent
                .iter()
                .filter_map(decode_motion_command)
                .filter(|&(device, _)| device == id)
                .map(|(_, setpoint)| setpoint)
                .collect();
            assert_eq!(holds.len(), 1, "device {}", id);
            assert_eq!(holds[0].position, 0.0);
            assert_eq!(holds[0].velocity, 0.0);
            assert_eq!(holds[0].acceleration, 0.0);
        }

        // Nothing keeps streaming after the fault
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.sent.lock().unwrap().len(), sent.len());
    }
}
