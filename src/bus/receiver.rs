// Dedicated receive loop
//
// Blocks on the bus with a short timeout on its own OS thread and forwards raw
// frames into a single-consumer queue. Never touches decoded state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{CanBus, Frame, Result};

pub struct ReceiveLoop {
    running: Arc<AtomicBool>,
    link_up: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveLoop {
    /// Start the loop. Frames arrive on the returned receiver until the loop
    /// is stopped or the bus fails.
    pub fn spawn(
        bus: Arc<dyn CanBus>,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Frame>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let link_up = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            let link_up = link_up.clone();
            thread::Builder::new()
                .name("bus-rx".into())
                .spawn(move || receive_loop(bus, timeout, tx, running, link_up))?
        };

        Ok((
            Self {
                running,
                link_up,
                handle: Some(handle),
            },
            rx,
        ))
    }

    /// Shared flag, cleared when the bus reports a fault.
    ///
    /// A fault ends the loop for good: the flag never comes back up. Recover
    /// by reopening the bus and spawning a new loop.
    pub fn link_up(&self) -> Arc<AtomicBool> {
        self.link_up.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to exit and wait for it (at most one receive timeout)
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Receive thread panicked");
            }
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    bus: Arc<dyn CanBus>,
    timeout: Duration,
    tx: mpsc::UnboundedSender<Frame>,
    running: Arc<AtomicBool>,
    link_up: Arc<AtomicBool>,
) {
    info!("Bus receive loop started");
    while running.load(Ordering::Acquire) {
        match bus.recv(timeout) {
            Ok(Some(frame)) => {
                if tx.send(frame).is_err() {
                    debug!("Frame consumer gone, stopping receive loop");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Bus receive failed: {}", e);
                link_up.store(false, Ordering::Release);
                break;
            }
        }
    }
    running.store(false, Ordering::Release);
    info!("Bus receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;

    #[tokio::test]
    async fn test_forwards_frames() {
        let bus = Arc::new(LoopbackBus::new());
        let (mut rx_loop, mut frames) =
            ReceiveLoop::spawn(bus.clone(), Duration::from_millis(5)).unwrap();

        let frame = Frame::new(0x181, &[0; 8]).unwrap();
        bus.inject(frame);
        assert_eq!(frames.recv().await, Some(frame));

        rx_loop.stop();
        assert!(!rx_loop.is_running());
    }

    #[tokio::test]
    async fn test_fault_clears_link_flag() {
        let bus = Arc::new(LoopbackBus::new());
        let (rx_loop, mut frames) =
            ReceiveLoop::spawn(bus.clone(), Duration::from_millis(5)).unwrap();
        let link_up = rx_loop.link_up();

        bus.disconnect();
        // Channel closes once the thread exits
        assert_eq!(frames.recv().await, None);
        assert!(!link_up.load(Ordering::Acquire));
    }
}
