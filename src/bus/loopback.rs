// In-memory bus for simulation and tests
//
// Every sent frame is recorded. An optional responder plays the part of the
// drives on the other end and injects its replies into the inbound queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{BusError, CanBus, Frame, Result};

/// Something that answers frames sent on a loopback bus
pub trait FrameResponder: Send {
    fn respond(&mut self, frame: &Frame) -> Vec<Frame>;
}

pub struct LoopbackBus {
    inbound_tx: Sender<Frame>,
    inbound_rx: Mutex<Receiver<Frame>>,
    sent: Mutex<Vec<Frame>>,
    connected: AtomicBool,
    responder: Mutex<Option<Box<dyn FrameResponder>>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            responder: Mutex::new(None),
        }
    }

    /// Loopback bus whose sent frames are answered by `responder`
    pub fn with_responder(responder: impl FrameResponder + 'static) -> Self {
        let bus = Self::new();
        *bus.responder.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(responder));
        bus
    }

    /// Push a frame as if a drive had sent it
    pub fn inject(&self, frame: Frame) {
        // The receiver lives as long as the bus, so this cannot fail
        let _ = self.inbound_tx.send(frame);
    }

    /// Every frame sent so far, oldest first
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Simulate the adapter being unplugged: all further I/O fails
    pub fn disconnect(&self) {
        debug!("Loopback bus disconnected");
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CanBus for LoopbackBus {
    fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(*frame);

        let mut responder = self.responder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(responder) = responder.as_mut() {
            for reply in responder.respond(frame) {
                self.inject(reply);
            }
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        let rx = self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl FrameResponder for Echo {
        fn respond(&mut self, frame: &Frame) -> Vec<Frame> {
            vec![Frame::new(frame.address() + 1, frame.payload()).unwrap()]
        }
    }

    #[test]
    fn test_records_sent_frames() {
        let bus = LoopbackBus::new();
        let frame = Frame::new(0x201, &[1]).unwrap();
        bus.send(&frame).unwrap();
        assert_eq!(bus.sent(), vec![frame]);

        bus.clear_sent();
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn test_inject_and_timeout() {
        let bus = LoopbackBus::new();
        assert!(bus.recv(Duration::from_millis(1)).unwrap().is_none());

        let frame = Frame::new(0x181, &[0; 8]).unwrap();
        bus.inject(frame);
        assert_eq!(bus.recv(Duration::from_millis(1)).unwrap(), Some(frame));
    }

    #[test]
    fn test_responder_replies() {
        let bus = LoopbackBus::with_responder(Echo);
        bus.send(&Frame::new(0x100, &[7]).unwrap()).unwrap();
        let reply = bus.recv(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(reply.address(), 0x101);
        assert_eq!(reply.payload(), &[7]);
    }

    #[test]
    fn test_disconnect_fails_io() {
        let bus = LoopbackBus::new();
        bus.disconnect();
        assert!(matches!(
            bus.send(&Frame::empty(0x080).unwrap()),
            Err(BusError::Disconnected)
        ));
        assert!(matches!(
            bus.recv(Duration::from_millis(1)),
            Err(BusError::Disconnected)
        ));
    }
}
