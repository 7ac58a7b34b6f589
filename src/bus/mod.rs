// CAN bus transport
//
// Provides:
// - Frame type (11-bit address, 0-8 payload bytes)
// - slcan (serial-line CAN) adapter over a serial port
// - In-memory loopback bus for simulation and tests
// - Dedicated receive loop feeding a single-consumer queue

mod frame;
pub mod loopback;
pub mod receiver;
pub mod slcan;

use std::time::Duration;

pub use frame::{Frame, FrameError, MAX_ADDRESS, MAX_PAYLOAD};
pub use loopback::{FrameResponder, LoopbackBus};
pub use receiver::ReceiveLoop;
pub use slcan::{Bitrate, SlcanBus};

/// Error types for bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Bus disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A shared bus that frames can be sent on and received from.
///
/// Implementations are shared between the receive loop and command senders,
/// so both directions take `&self`.
pub trait CanBus: Send + Sync {
    /// Queue a frame for transmission. Never waits for a reply.
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Wait up to `timeout` for the next inbound frame.
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>>;
}
