// Motion planning and synchronized execution
//
// Provides:
// - Jerk-limited S-curve planner with trapezoid/triangle fallback
// - Lockstep scheduler streaming planned setpoints to a group of drives

pub mod planner;
pub mod scheduler;

pub use planner::{MotionLimits, PlanError, ProfileKind, Trajectory, TrajectoryPoint, plan};
pub use scheduler::{MoveError, MoveFault, MoveSummary, Scheduler, SchedulerState, SyncGroup};
