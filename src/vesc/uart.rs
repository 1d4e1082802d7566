// VESC UART framing
//
// Frame format: [0x02, Length, Payload..., CRC_hi, CRC_lo, 0x03]
// The CRC16 covers the start byte, the length byte and the payload.

use serialport::{self, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::crc::crc16;
use super::{Command, TelemetryDelta, VescLink};
use crate::error::{LinkError, ProtocolError, TransportError};

/// Default serial configuration for VESC UART
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 5;

/// Frame delimiters
const START: u8 = 0x02;
const END: u8 = 0x03;

/// Start, length, two CRC bytes, end
const FRAME_OVERHEAD: usize = 5;

/// Bytes kept while waiting for a frame to complete. Anything older is stale.
const MAX_BUFFERED: usize = 1024;

/// Length of the GET_VALUES reply payload up to and including the fault byte
pub const GET_VALUES_LEN: usize = 54;

/// Packet ids (first payload byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketId {
    GetValues = 4,
    SetCurrent = 6,
    SetCurrentBrake = 7,
    SetRpm = 8,
    SetCurrentLimits = 21,
    SetBatteryCurrentLimits = 23,
    Alive = 30,
}

/// Wrap a payload of any length up to 255 bytes in a frame
pub fn build_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > u8::MAX as usize {
        return Err(ProtocolError::Oversize(payload.len()));
    }
    Ok(wrap(payload))
}

// Callers guarantee payload.len() <= 255
fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push(START);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);

    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.push(END);
    frame
}

/// Payload bytes for a command (packet id followed by big-endian fields)
fn command_payload(command: &Command) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9);
    match *command {
        Command::SetCurrent(ma) => {
            payload.push(PacketId::SetCurrent as u8);
            payload.extend_from_slice(&ma.to_be_bytes());
        }
        Command::SetCurrentBrake(ma) => {
            payload.push(PacketId::SetCurrentBrake as u8);
            payload.extend_from_slice(&ma.to_be_bytes());
        }
        Command::SetRpm(erpm) => {
            payload.push(PacketId::SetRpm as u8);
            payload.extend_from_slice(&erpm.to_be_bytes());
        }
        Command::SetCurrentLimits { min, max } => {
            payload.push(PacketId::SetCurrentLimits as u8);
            payload.extend_from_slice(&min.to_be_bytes());
            payload.extend_from_slice(&max.to_be_bytes());
        }
        Command::SetBatteryCurrentLimits { min, max } => {
            payload.push(PacketId::SetBatteryCurrentLimits as u8);
            payload.extend_from_slice(&min.to_be_bytes());
            payload.extend_from_slice(&max.to_be_bytes());
        }
        Command::Heartbeat => payload.push(PacketId::Alive as u8),
        Command::GetValues => payload.push(PacketId::GetValues as u8),
    }
    payload
}

/// Encode a command into a complete UART frame
pub fn encode(command: &Command) -> Vec<u8> {
    wrap(&command_payload(command))
}

pub fn encode_set_current(amps: f32) -> Vec<u8> {
    encode(&Command::set_current(amps))
}

pub fn encode_set_current_brake(amps: f32) -> Vec<u8> {
    encode(&Command::set_current_brake(amps))
}

pub fn encode_set_rpm(erpm: i32) -> Vec<u8> {
    encode(&Command::set_rpm(erpm))
}

pub fn encode_set_current_limits(min_amps: f32, max_amps: f32) -> Vec<u8> {
    encode(&Command::set_current_limits(min_amps, max_amps))
}

pub fn encode_set_battery_current_limits(min_amps: f32, max_amps: f32) -> Vec<u8> {
    encode(&Command::set_battery_current_limits(min_amps, max_amps))
}

pub fn encode_heartbeat() -> Vec<u8> {
    encode(&Command::Heartbeat)
}

/// Verify a complete frame and return its payload
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(ProtocolError::Truncated {
            expected: FRAME_OVERHEAD,
            got: frame.len(),
        });
    }
    if frame[0] != START {
        return Err(ProtocolError::BadDelimiter(frame[0]));
    }

    let len = frame[1] as usize;
    let expected = len + FRAME_OVERHEAD;
    if frame.len() != expected {
        return Err(ProtocolError::Truncated {
            expected,
            got: frame.len(),
        });
    }
    if frame[expected - 1] != END {
        return Err(ProtocolError::BadDelimiter(frame[expected - 1]));
    }

    let computed = crc16(&frame[..2 + len]);
    let received = u16::from_be_bytes([frame[2 + len], frame[3 + len]]);
    if computed != received {
        return Err(ProtocolError::ChecksumMismatch { computed, received });
    }

    Ok(&frame[2..2 + len])
}

fn be_i16(b: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([b[at], b[at + 1]])
}

fn be_i32(b: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Decode a GET_VALUES reply payload
///
/// Layout (big-endian): id, temp_fet*10 (i16), temp_motor*10 (i16),
/// motor_current*100 (i32), input_current*100 (i32), id*100, iq*100,
/// duty*1000 (i16), rpm (i32), v_in*10 (i16), four energy counters (i32),
/// tachometer, tachometer_abs (i32), fault (u8).
pub fn decode_status(payload: &[u8]) -> Result<TelemetryDelta, ProtocolError> {
    let Some(&id) = payload.first() else {
        return Err(ProtocolError::Truncated {
            expected: GET_VALUES_LEN,
            got: 0,
        });
    };
    if id != PacketId::GetValues as u8 {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    if payload.len() < GET_VALUES_LEN {
        return Err(ProtocolError::Truncated {
            expected: GET_VALUES_LEN,
            got: payload.len(),
        });
    }

    Ok(TelemetryDelta {
        controller_temp: Some(be_i16(payload, 1)),
        motor_temp: Some(be_i16(payload, 3)),
        motor_current: Some(be_i32(payload, 5)),
        battery_current: Some(be_i32(payload, 9)),
        speed_erpm: Some(be_i32(payload, 23)),
        // decivolts on the wire
        battery_voltage: Some(be_i16(payload, 27) as i32 * 10),
        state_of_charge: None,
        fault: Some(payload[53]),
    })
}

/// Reassembles frames from a byte stream, resynchronizing on the start
/// byte after anything that fails verification.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFERED {
            let excess = self.buf.len() - MAX_BUFFERED;
            self.buf.drain(..excess);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame's payload, a rejected frame, or `None` when more
    /// bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        match self.buf.iter().position(|&b| b == START) {
            Some(0) => {}
            Some(skip) => {
                self.buf.drain(..skip);
            }
            None => {
                self.buf.clear();
                return None;
            }
        }

        if self.buf.len() < 2 {
            return None;
        }
        let total = self.buf[1] as usize + FRAME_OVERHEAD;
        if self.buf.len() < total {
            return None;
        }

        match decode_frame(&self.buf[..total]) {
            Ok(payload) => {
                let payload = payload.to_vec();
                self.buf.drain(..total);
                Some(Ok(payload))
            }
            Err(e) => {
                // Drop the bogus start byte and look for the next one
                self.buf.drain(..1);
                Some(Err(e))
            }
        }
    }
}

/// One VESC on its own serial port
pub struct UartLink {
    port: Box<dyn SerialPort>,
    decoder: FrameDecoder,
}

impl UartLink {
    pub fn open(port_name: &str) -> Result<Self, TransportError> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self, TransportError> {
        info!("Opening VESC UART on {} @ {}", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            port,
            decoder: FrameDecoder::new(),
        })
    }

    /// Pull whatever the port has buffered without waiting
    fn fill(&mut self) -> Result<(), TransportError> {
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(());
        }
        let mut chunk = vec![0u8; available];
        let n = self.port.read(&mut chunk).map_err(map_io)?;
        self.decoder.push(&chunk[..n]);
        Ok(())
    }
}

fn map_io(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout,
        io::ErrorKind::WouldBlock => TransportError::Busy,
        _ => TransportError::Io(e),
    }
}

impl VescLink for UartLink {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        let frame = encode(command);
        debug!("UART tx {:?}: {:02X?}", command, frame);
        self.port.write_all(&frame).map_err(map_io)?;
        self.port.flush().map_err(map_io)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<TelemetryDelta>, LinkError> {
        if self.decoder.buffered() < GET_VALUES_LEN + FRAME_OVERHEAD {
            self.fill()?;
        }
        match self.decoder.next_frame() {
            None => Ok(None),
            Some(Ok(payload)) => Ok(Some(decode_status(&payload)?)),
            Some(Err(e)) => Err(e.into()),
        }
    }
}
