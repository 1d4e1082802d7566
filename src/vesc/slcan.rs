// SLCAN (Lawicel ASCII) adapter
//
// Extended data frame: "T" + 8 hex id + dlc digit + 2 hex per data byte + "\r"
// Setup: "C\r" close, "S<n>\r" bitrate, "O\r" open

use embedded_can::{ExtendedId, Frame};
use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::can::{CanBus, CanFrame, Demux};
use crate::error::{LinkError, ProtocolError, TransportError};

pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_BITRATE: u32 = 500_000;
const TIMEOUT_MS: u64 = 5;

/// Longest line we accept: T + 8 id + 1 dlc + 16 data
const MAX_LINE: usize = 26;

/// Lawicel bitrate setup code
pub fn bitrate_code(bitrate: u32) -> Option<char> {
    let code = match bitrate {
        10_000 => '0',
        20_000 => '1',
        50_000 => '2',
        100_000 => '3',
        125_000 => '4',
        250_000 => '5',
        500_000 => '6',
        800_000 => '7',
        1_000_000 => '8',
        _ => return None,
    };
    Some(code)
}

pub fn format_frame(frame: &CanFrame) -> String {
    let mut line = format!("T{:08X}{}", frame.raw_id(), frame.data().len());
    for b in frame.data() {
        line.push_str(&format!("{:02X}", b));
    }
    line.push('\r');
    line
}

fn hex(s: &str, line: &str) -> Result<u32, ProtocolError> {
    u32::from_str_radix(s, 16).map_err(|_| ProtocolError::MalformedLine(line.to_string()))
}

/// Parse one line (without the trailing '\r'). Acknowledgements and
/// standard-id frames yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<CanFrame>, ProtocolError> {
    let malformed = || ProtocolError::MalformedLine(line.to_string());
    if !line.starts_with('T') {
        return Ok(None);
    }
    if !line.is_ascii() || line.len() < 10 {
        return Err(malformed());
    }

    let id = hex(&line[1..9], line)?;
    let dlc = line[9..10].parse::<usize>().map_err(|_| malformed())?;
    if dlc > 8 || line.len() != 10 + dlc * 2 {
        return Err(malformed());
    }

    let mut data = [0u8; 8];
    for (i, byte) in data.iter_mut().take(dlc).enumerate() {
        let at = 10 + i * 2;
        *byte = hex(&line[at..at + 2], line)? as u8;
    }
    let id = ExtendedId::new(id).ok_or_else(malformed)?;
    Ok(CanFrame::new(id, &data[..dlc]))
}

/// SLCAN adapter on a serial port, shared by every VESC on the bus
pub struct SlcanBus {
    port: Box<dyn SerialPort>,
    line: Vec<u8>,
    demux: Demux,
}

impl SlcanBus {
    pub fn open(port_name: &str, bitrate: u32) -> Result<Self, TransportError> {
        let code = bitrate_code(bitrate).ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported CAN bitrate {}", bitrate),
            ))
        })?;

        info!("Opening SLCAN adapter on {} ({} bit/s)", port_name, bitrate);
        let mut port = serialport::new(port_name, DEFAULT_BAUDRATE)
            .timeout(Duration::from_millis(TIMEOUT_MS))
            .open()?;

        port.write_all(b"C\r")?;
        port.write_all(format!("S{}\r", code).as_bytes())?;
        port.write_all(b"O\r")?;
        port.flush()?;

        Ok(Self {
            port,
            line: Vec::with_capacity(MAX_LINE),
            demux: Demux::default(),
        })
    }

    /// Move every complete line currently buffered by the port into the
    /// per-node queues. Returns the first malformed line, if any.
    fn pump(&mut self) -> Result<(), LinkError> {
        let available = self.port.bytes_to_read().map_err(TransportError::from)? as usize;
        if available == 0 {
            return Ok(());
        }
        let mut chunk = vec![0u8; available];
        let n = self.port.read(&mut chunk).map_err(TransportError::from)?;

        let mut first_error = None;
        for &b in &chunk[..n] {
            if b != b'\r' {
                if self.line.len() < MAX_LINE {
                    self.line.push(b);
                }
                continue;
            }
            let text = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            match parse_line(&text) {
                Ok(Some(frame)) => self.demux.push(frame),
                Ok(None) => {}
                Err(e) => {
                    debug!("SLCAN rx rejected: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl CanBus for SlcanBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let line = format_frame(frame);
        self.port.write_all(line.as_bytes()).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            std::io::ErrorKind::WouldBlock => TransportError::Busy,
            _ => TransportError::Io(e),
        })?;
        Ok(())
    }

    fn receive_for(&mut self, node_id: u8) -> Result<Option<CanFrame>, LinkError> {
        if let Some(frame) = self.demux.pop(node_id) {
            return Ok(Some(frame));
        }
        self.pump()?;
        Ok(self.demux.pop(node_id))
    }

    fn dropped(&self, node_id: u8) -> u64 {
        self.demux.dropped(node_id)
    }
}
