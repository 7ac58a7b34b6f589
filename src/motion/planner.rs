// Jerk-limited point-to-point trajectory planner
//
// Seven-phase symmetric S-curve:
//   1. jerk up      (acceleration ramps 0 -> a_max)
//   2. const accel
//   3. jerk down    (acceleration ramps a_max -> 0)
//   4. cruise at v_max
//   5. jerk down    (deceleration ramps in)
//   6. const decel
//   7. jerk up      (deceleration ramps out)
// Moves too short for that fall back to a trapezoid, or a triangle when even
// the trapezoid's ramps don't fit. Pure functions, no shared state.

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_JERK_RATIO, SAMPLE_PERIOD};
use crate::protocol::MotionSetpoint;

/// Moves shorter than this plan as a single hold point
pub const POSITION_EPSILON: f64 = 1e-9;

/// Upper bound on samples in one plan
pub const MAX_TRAJECTORY_POINTS: usize = 2_000_000;

/// Margin keeping the last regular sample strictly before the end time
const TIME_EPSILON: f64 = 1e-12;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("Maximum velocity must be positive and finite, got {0}")]
    InvalidVelocity(f64),

    #[error("Maximum acceleration must be positive and finite, got {0}")]
    InvalidAcceleration(f64),

    #[error("Jerk ratio must be positive and finite, got {0}")]
    InvalidJerkRatio(f64),

    #[error("Sample period must be positive and finite, got {0}")]
    InvalidSamplePeriod(f64),

    #[error("Start and target positions must be finite")]
    NonFinitePosition,

    #[error("Move needs {points} samples, limit is {limit}")]
    TooManyPoints { points: usize, limit: usize },
}

/// Kinematic limits for one move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionLimits {
    pub max_velocity: f64,
    pub max_acceleration: f64,
    /// j_max = jerk_ratio * a_max
    pub jerk_ratio: f64,
    /// Seconds between samples
    pub sample_period: f64,
}

impl MotionLimits {
    /// Limits with the default jerk ratio and sample period
    pub fn new(max_velocity: f64, max_acceleration: f64) -> Self {
        Self {
            max_velocity,
            max_acceleration,
            jerk_ratio: DEFAULT_JERK_RATIO,
            sample_period: SAMPLE_PERIOD.as_secs_f64(),
        }
    }

    pub fn max_jerk(&self) -> f64 {
        self.jerk_ratio * self.max_acceleration
    }

    fn validate(&self) -> Result<(), PlanError> {
        let usable = |v: f64| v.is_finite() && v > 0.0;
        if !usable(self.max_velocity) {
            return Err(PlanError::InvalidVelocity(self.max_velocity));
        }
        if !usable(self.max_acceleration) {
            return Err(PlanError::InvalidAcceleration(self.max_acceleration));
        }
        if !usable(self.jerk_ratio) {
            return Err(PlanError::InvalidJerkRatio(self.jerk_ratio));
        }
        if !usable(self.sample_period) {
            return Err(PlanError::InvalidSamplePeriod(self.sample_period));
        }
        Ok(())
    }
}

/// One time-stamped setpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrajectoryPoint {
    /// Seconds from plan start
    pub t: f64,
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
}

impl TrajectoryPoint {
    pub fn setpoint(&self) -> MotionSetpoint {
        MotionSetpoint {
            position: self.position,
            velocity: self.velocity,
            acceleration: self.acceleration,
        }
    }
}

/// Shape the planner chose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    SCurve,
    Trapezoidal,
    Triangular,
    /// Start and target coincide
    Hold,
}

/// Planned move: samples at a fixed period plus a final point pinned to the target
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    kind: ProfileKind,
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Never true: every plan has at least the final point
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TrajectoryPoint> {
        self.points.get(index)
    }

    /// Total duration in seconds
    pub fn duration(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.t)
    }

    pub fn target(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.position)
    }

    pub fn peak_velocity(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.velocity.abs())
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KinematicState {
    position: f64,
    velocity: f64,
    acceleration: f64,
}

impl KinematicState {
    /// Closed-form state after `dt` seconds under constant jerk
    fn advance(&self, jerk: f64, dt: f64) -> Self {
        let dt2 = dt * dt;
        Self {
            position: self.position
                + self.velocity * dt
                + 0.5 * self.acceleration * dt2
                + jerk * dt2 * dt / 6.0,
            velocity: self.velocity + self.acceleration * dt + 0.5 * jerk * dt2,
            acceleration: self.acceleration + jerk * dt,
        }
    }
}

/// Constant-jerk segment starting from an exact boundary state
#[derive(Debug, Clone, Copy)]
struct Phase {
    start: f64,
    duration: f64,
    jerk: f64,
    initial: KinematicState,
}

/// Piecewise constant-jerk profile for a non-negative move starting at 0
#[derive(Debug, Default)]
struct Profile {
    phases: Vec<Phase>,
    end_time: f64,
    state: KinematicState,
}

impl Profile {
    /// Append a phase; its end state becomes the next phase's start state
    fn push(&mut self, duration: f64, jerk: f64) {
        let duration = duration.max(0.0);
        self.phases.push(Phase {
            start: self.end_time,
            duration,
            jerk,
            initial: self.state,
        });
        self.state = self.state.advance(jerk, duration);
        self.end_time += duration;
    }

    /// Step the acceleration at the current boundary (zero-jerk profiles)
    fn set_acceleration(&mut self, acceleration: f64) {
        self.state.acceleration = acceleration;
    }

    fn sample(&self, t: f64) -> KinematicState {
        let phase = self
            .phases
            .iter()
            .rev()
            .find(|phase| phase.start <= t)
            .or(self.phases.first());

        match phase {
            Some(phase) => {
                let dt = (t - phase.start).clamp(0.0, phase.duration);
                phase.initial.advance(phase.jerk, dt)
            }
            None => KinematicState::default(),
        }
    }
}

fn s_curve(distance: f64, v_max: f64, a_max: f64, j_max: f64) -> Option<Profile> {
    let t_j = a_max / j_max;
    let t_a = v_max / a_max - t_j;
    if t_a < 0.0 {
        return None;
    }

    // Displacement of one full ramp from rest to v_max
    let p_ramp = 0.5 * v_max * (v_max / a_max + a_max / j_max);
    let cruise_distance = distance - 2.0 * p_ramp;
    if cruise_distance <= 0.0 {
        return None;
    }
    let t_cruise = cruise_distance / v_max;

    let mut profile = Profile::default();
    profile.push(t_j, j_max);
    profile.push(t_a, 0.0);
    profile.push(t_j, -j_max);
    profile.push(t_cruise, 0.0);
    profile.push(t_j, -j_max);
    profile.push(t_a, 0.0);
    profile.push(t_j, j_max);
    Some(profile)
}

fn trapezoid(distance: f64, v_max: f64, a_max: f64) -> (ProfileKind, Profile) {
    let mut profile = Profile::default();

    // Full ramp up plus full ramp down covers v^2 / a
    let ramp_pair_distance = v_max * v_max / a_max;
    if distance >= ramp_pair_distance {
        let t_ramp = v_max / a_max;
        let t_cruise = (distance - ramp_pair_distance) / v_max;

        profile.set_acceleration(a_max);
        profile.push(t_ramp, 0.0);
        profile.set_acceleration(0.0);
        profile.push(t_cruise, 0.0);
        profile.set_acceleration(-a_max);
        profile.push(t_ramp, 0.0);
        (ProfileKind::Trapezoidal, profile)
    } else {
        // No cruise: a * t_ramp^2 = distance
        let t_ramp = (distance / a_max).sqrt();

        profile.set_acceleration(a_max);
        profile.push(t_ramp, 0.0);
        profile.set_acceleration(-a_max);
        profile.push(t_ramp, 0.0);
        (ProfileKind::Triangular, profile)
    }
}

/// Plan a move from `start` to `target` under `limits`.
///
/// The first point is the start state at t = 0, the last is exactly `target`
/// at rest. Invalid limits are rejected before anything is computed.
pub fn plan(start: f64, target: f64, limits: &MotionLimits) -> Result<Trajectory, PlanError> {
    limits.validate()?;
    if !start.is_finite() || !target.is_finite() {
        return Err(PlanError::NonFinitePosition);
    }

    let delta = target - start;
    let distance = delta.abs();
    if distance < POSITION_EPSILON {
        return Ok(Trajectory {
            kind: ProfileKind::Hold,
            points: vec![TrajectoryPoint {
                t: 0.0,
                position: start,
                velocity: 0.0,
                acceleration: 0.0,
            }],
        });
    }

    let v_max = limits.max_velocity;
    let a_max = limits.max_acceleration;
    let (kind, profile) = match s_curve(distance, v_max, a_max, limits.max_jerk()) {
        Some(profile) => (ProfileKind::SCurve, profile),
        None => trapezoid(distance, v_max, a_max),
    };

    let period = limits.sample_period;
    let end_time = profile.end_time;
    let estimated = (end_time / period).ceil() + 1.0;
    if !estimated.is_finite() || estimated > MAX_TRAJECTORY_POINTS as f64 {
        return Err(PlanError::TooManyPoints {
            points: if estimated.is_finite() {
                estimated as usize
            } else {
                usize::MAX
            },
            limit: MAX_TRAJECTORY_POINTS,
        });
    }

    let sign = delta.signum();
    let mut points = Vec::with_capacity(estimated as usize + 1);
    let mut k: usize = 0;
    loop {
        // Multiply rather than accumulate so sample times don't drift
        let t = k as f64 * period;
        if t >= end_time - TIME_EPSILON {
            break;
        }
        let state = profile.sample(t);
        points.push(TrajectoryPoint {
            t,
            position: start + sign * state.position,
            velocity: sign * state.velocity,
            acceleration: sign * state.acceleration,
        });
        k += 1;
    }

    // Pin the end exactly, whatever residual the integration left
    points.push(TrajectoryPoint {
        t: end_time,
        position: target,
        velocity: 0.0,
        acceleration: 0.0,
    });

    Ok(Trajectory { kind, points })
}
