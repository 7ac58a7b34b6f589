// Timeouts, topics, bus and motion configuration
use std::time::Duration;

// Runtime loop frequency (command drain + state publishing)
pub const LOOP_HZ: u64 = 50;

// How long the receive loop blocks on the bus before re-checking its stop flag
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

// Scheduler tick; must stay well under the sample period
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

// Spacing of planned trajectory points
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(5);

// j_max = DEFAULT_JERK_RATIO * a_max
pub const DEFAULT_JERK_RATIO: f64 = 10.0;

// Limits used when a move command leaves them out
pub const DEFAULT_MAX_VELOCITY: f64 = 5.0; // rad/s
pub const DEFAULT_MAX_ACCELERATION: f64 = 20.0; // rad/s^2

// Spacing between the reads of a full parameter request
pub const PARAMETER_REQUEST_INTERVAL: Duration = Duration::from_millis(50);

// Capacity of the event/change broadcast channels
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// Zenoh topics
pub const TOPIC_CMD: &str = "focbus/cmd"; // commands
pub const TOPIC_DEVICES: &str = "focbus/state/devices"; // registry snapshots
pub const TOPIC_MOTION: &str = "focbus/state/motion"; // scheduler state

// Bus configuration
// Serial port of the slcan adapter
pub const BUS_PORT: &str = "/dev/ttyACM0";

// CAN bitrate on the drive bus
pub const BUS_BITRATE: u32 = 1_000_000;
