// Raw CAN frame: 11-bit standard identifier plus up to 8 payload bytes

use std::fmt;

/// Highest standard (11-bit) identifier
pub const MAX_ADDRESS: u16 = 0x7FF;

/// Classic CAN payload limit
pub const MAX_PAYLOAD: usize = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Address 0x{0:03X} does not fit in 11 bits")]
    AddressOutOfRange(u16),

    #[error("Payload of {0} bytes exceeds the 8-byte limit")]
    PayloadTooLong(usize),
}

/// A single bus frame. Immutable once built.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    address: u16,
    len: u8,
    data: [u8; MAX_PAYLOAD],
}

impl Frame {
    pub fn new(address: u16, payload: &[u8]) -> Result<Self, FrameError> {
        if address > MAX_ADDRESS {
            return Err(FrameError::AddressOutOfRange(address));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }

        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            address,
            len: payload.len() as u8,
            data,
        })
    }

    /// Build a frame from parts the caller already knows are in range.
    ///
    /// Callers must pass an address of at most `MAX_ADDRESS` (a class base
    /// plus a validated device id) and at most `MAX_PAYLOAD` bytes. Anything
    /// else panics in debug builds; release builds mask the address to 11
    /// bits and cut the payload at 8 bytes. Use `Frame::new` for parts that
    /// come from outside the codec.
    pub(crate) fn standard(address: u16, payload: &[u8]) -> Self {
        debug_assert!(address <= MAX_ADDRESS && payload.len() <= MAX_PAYLOAD);
        let len = payload.len().min(MAX_PAYLOAD);
        let mut data = [0u8; MAX_PAYLOAD];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            address: address & MAX_ADDRESS,
            len: len as u8,
            data,
        }
    }

    /// Zero-payload frame (discovery, sync barrier)
    pub fn empty(address: u16) -> Result<Self, FrameError> {
        Self::new(address, &[])
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(0x{:03X}, {:02X?})", self.address, self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limits() {
        assert!(Frame::new(0x7FF, &[0; 8]).is_ok());
        assert_eq!(
            Frame::new(0x800, &[]),
            Err(FrameError::AddressOutOfRange(0x800))
        );
        assert_eq!(
            Frame::new(0x100, &[0; 9]),
            Err(FrameError::PayloadTooLong(9))
        );
    }

    #[test]
    fn test_payload_view() {
        let frame = Frame::new(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(frame.address(), 0x123);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert!(Frame::empty(0x080).unwrap().is_empty());
    }

    #[test]
    fn test_standard_matches_checked_constructor() {
        use crate::protocol::codec::{
            CHARACTERIZATION_BASE, COMMAND_BASE, DISCOVERY_ADDRESS, MAX_DEVICE_ID,
            MOTION_COMMAND_BASE, RESPONSE_BASE, STATUS_FEEDBACK_BASE, TELEMETRY_BASE,
        };

        // Highest address each message class can produce
        let bases = [
            TELEMETRY_BASE,
            COMMAND_BASE,
            RESPONSE_BASE,
            CHARACTERIZATION_BASE,
            STATUS_FEEDBACK_BASE,
            MOTION_COMMAND_BASE,
        ];
        for base in bases {
            let address = base + u16::from(MAX_DEVICE_ID);
            assert!(address <= MAX_ADDRESS, "0x{:03X}", address);
            assert_eq!(
                Frame::standard(address, &[7; 8]),
                Frame::new(address, &[7; 8]).unwrap()
            );
        }
        assert_eq!(
            Frame::standard(DISCOVERY_ADDRESS, &[]),
            Frame::empty(DISCOVERY_ADDRESS).unwrap()
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn test_standard_rejects_out_of_range_in_debug() {
        let _ = Frame::standard(0x800, &[0; 9]);
    }
}
