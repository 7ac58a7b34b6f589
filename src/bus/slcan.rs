// slcan (Lawicel) serial-line CAN adapter
//
// ASCII protocol, every command terminated by '\r':
//   S<n>            set bitrate (S0 = 10k ... S8 = 1M)
//   O / C           open / close the CAN channel
//   t<iii><l><dd..> standard frame: 3 hex id digits, 1 dlc digit, 2 hex digits per byte
// Adapters answer commands with '\r' (ok) or BEL (error) and may append a
// 4-digit timestamp to received frames.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{BusError, CanBus, Frame, MAX_PAYLOAD, Result};

/// Default serial configuration for USB slcan adapters
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

const LINE_END: u8 = b'\r';
const BELL: u8 = 0x07;

/// Longest line we accept before assuming the stream is garbage
/// ('t' + 3 id + 1 dlc + 16 data + 4 timestamp)
const MAX_LINE: usize = 32;

const CMD_OPEN: &[u8] = b"O\r";
const CMD_CLOSE: &[u8] = b"C\r";

/// CAN bitrates supported by the slcan `S` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    K10,
    K20,
    K50,
    K100,
    K125,
    K250,
    K500,
    K800,
    M1,
}

impl Bitrate {
    /// Map a bitrate in bit/s to the matching slcan setting
    pub fn from_bps(bps: u32) -> Option<Self> {
        Some(match bps {
            10_000 => Self::K10,
            20_000 => Self::K20,
            50_000 => Self::K50,
            100_000 => Self::K100,
            125_000 => Self::K125,
            250_000 => Self::K250,
            500_000 => Self::K500,
            800_000 => Self::K800,
            1_000_000 => Self::M1,
            _ => return None,
        })
    }

    fn command(self) -> [u8; 3] {
        let code = match self {
            Self::K10 => b'0',
            Self::K20 => b'1',
            Self::K50 => b'2',
            Self::K100 => b'3',
            Self::K125 => b'4',
            Self::K250 => b'5',
            Self::K500 => b'6',
            Self::K800 => b'7',
            Self::M1 => b'8',
        };
        [b'S', code, LINE_END]
    }
}

/// Read half: raw byte buffer plus frames already split out of it
struct SlcanReader {
    port: Box<dyn SerialPort>,
    buffer: Vec<u8>,
    pending: VecDeque<Frame>,
}

/// CAN bus reached through an slcan adapter
pub struct SlcanBus {
    writer: Mutex<Box<dyn SerialPort>>,
    reader: Mutex<SlcanReader>,
}

impl SlcanBus {
    /// Open the adapter with the default serial baudrate
    pub fn open(port_name: &str, bitrate: Bitrate) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE, bitrate)
    }

    /// Open with custom serial baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32, bitrate: Bitrate) -> Result<Self> {
        info!("Opening slcan adapter on {} ({:?})", port_name, bitrate);
        let mut port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        // Channel may still be open from a previous session
        port.write_all(CMD_CLOSE)?;
        port.write_all(&bitrate.command())?;
        port.write_all(CMD_OPEN)?;
        port.flush()?;

        let reader_port = port.try_clone()?;
        Ok(Self {
            writer: Mutex::new(port),
            reader: Mutex::new(SlcanReader {
                port: reader_port,
                buffer: Vec::with_capacity(MAX_LINE * 4),
                pending: VecDeque::new(),
            }),
        })
    }
}

impl CanBus for SlcanBus {
    fn send(&self, frame: &Frame) -> Result<()> {
        let line = encode_line(frame);
        trace!("slcan tx {:?}", frame);

        let mut port = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        port.write_all(&line)?;
        port.flush()?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(frame) = reader.pending.pop_front() {
            return Ok(Some(frame));
        }

        reader.port.set_timeout(timeout)?;
        let mut chunk = [0u8; 64];
        let n = match reader.port.read(&mut chunk) {
            Ok(0) => return Err(BusError::Disconnected),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(BusError::Io(e)),
        };
        reader.buffer.extend_from_slice(&chunk[..n]);

        while let Some(end) = reader
            .buffer
            .iter()
            .position(|&b| b == LINE_END || b == BELL)
        {
            let line: Vec<u8> = reader.buffer.drain(..=end).collect();
            if line[end] == BELL {
                warn!("slcan adapter rejected a command");
                continue;
            }
            match parse_line(&line[..end]) {
                Some(frame) => reader.pending.push_back(frame),
                None => trace!("slcan: ignoring line {:?}", String::from_utf8_lossy(&line)),
            }
        }

        if reader.buffer.len() > MAX_LINE {
            debug!("slcan: dropping {} unterminated bytes", reader.buffer.len());
            reader.buffer.clear();
        }

        Ok(reader.pending.pop_front())
    }
}

impl Drop for SlcanBus {
    fn drop(&mut self) {
        // Leave the adapter with its channel closed
        let port = self.writer.get_mut().unwrap_or_else(|e| e.into_inner());
        let closed = port.write_all(CMD_CLOSE);
        if let Err(e) = closed.and_then(|_| port.flush()) {
            warn!("Failed to close slcan channel on drop: {}", e);
        }
    }
}

/// Build the ASCII line for a standard frame
fn encode_line(frame: &Frame) -> Vec<u8> {
    let mut line = format!("t{:03X}{:X}", frame.address(), frame.len());
    for byte in frame.payload() {
        line.push_str(&format!("{:02X}", byte));
    }
    let mut bytes = line.into_bytes();
    bytes.push(LINE_END);
    bytes
}

/// Parse one received line (terminator stripped). Anything that is not a
/// well-formed standard data frame yields `None`.
fn parse_line(line: &[u8]) -> Option<Frame> {
    if line.len() < 5 || line[0] != b't' || !line.is_ascii() {
        return None;
    }

    let text = std::str::from_utf8(line).ok()?;
    let address = u16::from_str_radix(&text[1..4], 16).ok()?;
    let dlc = usize::from_str_radix(&text[4..5], 16).ok()?;
    if dlc > MAX_PAYLOAD || text.len() < 5 + dlc * 2 {
        return None;
    }

    let mut payload = [0u8; MAX_PAYLOAD];
    for (i, byte) in payload.iter_mut().take(dlc).enumerate() {
        let start = 5 + i * 2;
        *byte = u8::from_str_radix(&text[start..start + 2], 16).ok()?;
    }

    Frame::new(address, &payload[..dlc]).ok()
}
