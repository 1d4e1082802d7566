// VESC CAN framing
//
// 29-bit extended id = node_id | (command << 8). No application checksum,
// the CAN controller already guarantees frame integrity.
// All multi-byte fields are big-endian.

use embedded_can::{ExtendedId, Frame, Id};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, warn};

use super::uart::PacketId;
use super::{Command, TelemetryDelta, VescLink};
use crate::error::{LinkError, ProtocolError, TransportError};

/// Node id this runtime uses as sender when it has to name itself
pub const HOST_NODE_ID: u8 = 0xFE;

/// Frames queued per node before the oldest one is dropped
const QUEUE_DEPTH: usize = 32;

/// CAN command codes (bits 8..16 of the extended id)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanCommand {
    SetCurrent = 1,
    SetCurrentBrake = 2,
    SetRpm = 3,
    ProcessShortBuffer = 8,
    Status1 = 9,
    Status4 = 16,
    SetCurrentLimits = 21,
    SetBatteryCurrentLimits = 23,
    Status5 = 27,
    Status7 = 99,
}

/// Classic data frame with an extended id, the only kind a VESC sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: ExtendedId,
    data: [u8; 8],
    len: u8,
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let Id::Extended(id) = id.into() else {
            return None;
        };
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            len: data.len() as u8,
        })
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        true
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Extended(self.id)
    }

    fn dlc(&self) -> usize {
        self.len as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl CanFrame {
    /// Copy any bus frame. Standard ids and remote frames are not VESC
    /// traffic and give `None`.
    pub fn from_frame<F: Frame>(frame: &F) -> Option<Self> {
        if frame.is_remote_frame() {
            return None;
        }
        Self::new(frame.id(), frame.data())
    }

    pub fn raw_id(&self) -> u32 {
        self.id.as_raw()
    }

    pub fn node_id(&self) -> u8 {
        (self.raw_id() & 0xFF) as u8
    }

    pub fn command(&self) -> u8 {
        ((self.raw_id() >> 8) & 0xFF) as u8
    }
}

pub fn frame_id(node_id: u8, command: CanCommand) -> ExtendedId {
    // 16 significant bits, always inside the 29-bit range
    ExtendedId::new(node_id as u32 | ((command as u32) << 8)).unwrap_or(ExtendedId::ZERO)
}

fn one(node_id: u8, command: CanCommand, value: i32) -> CanFrame {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&value.to_be_bytes());
    CanFrame {
        id: frame_id(node_id, command),
        data,
        len: 4,
    }
}

fn two(node_id: u8, command: CanCommand, a: i32, b: i32) -> CanFrame {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&a.to_be_bytes());
    data[4..].copy_from_slice(&b.to_be_bytes());
    CanFrame {
        id: frame_id(node_id, command),
        data,
        len: 8,
    }
}

/// Encode a command for `node_id`. `GetValues` has no CAN form.
pub fn encode(node_id: u8, command: &Command) -> Option<CanFrame> {
    let frame = match *command {
        Command::SetCurrent(ma) => one(node_id, CanCommand::SetCurrent, ma),
        Command::SetCurrentBrake(ma) => one(node_id, CanCommand::SetCurrentBrake, ma),
        Command::SetRpm(erpm) => one(node_id, CanCommand::SetRpm, erpm),
        Command::SetCurrentLimits { min, max } => {
            two(node_id, CanCommand::SetCurrentLimits, min, max)
        }
        Command::SetBatteryCurrentLimits { min, max } => {
            two(node_id, CanCommand::SetBatteryCurrentLimits, min, max)
        }
        Command::Heartbeat => {
            let mut d = [0u8; 8];
            d[..3].copy_from_slice(&[HOST_NODE_ID, 0, PacketId::Alive as u8]);
            CanFrame {
                id: frame_id(node_id, CanCommand::ProcessShortBuffer),
                data: d,
                len: 3,
            }
        }
        Command::GetValues => return None,
    };
    Some(frame)
}

pub fn encode_set_current(node_id: u8, amps: f32) -> CanFrame {
    one(node_id, CanCommand::SetCurrent, super::amps_to_milliamps(amps))
}

pub fn encode_set_current_brake(node_id: u8, amps: f32) -> CanFrame {
    one(node_id, CanCommand::SetCurrentBrake, super::amps_to_milliamps(amps))
}

pub fn encode_set_rpm(node_id: u8, erpm: i32) -> CanFrame {
    one(node_id, CanCommand::SetRpm, erpm)
}

pub fn encode_set_current_limits(node_id: u8, min_amps: f32, max_amps: f32) -> CanFrame {
    two(
        node_id,
        CanCommand::SetCurrentLimits,
        super::amps_to_milliamps(min_amps),
        super::amps_to_milliamps(max_amps),
    )
}

pub fn encode_set_battery_current_limits(node_id: u8, min_amps: f32, max_amps: f32) -> CanFrame {
    two(
        node_id,
        CanCommand::SetBatteryCurrentLimits,
        super::amps_to_milliamps(min_amps),
        super::amps_to_milliamps(max_amps),
    )
}

fn need(frame: &CanFrame, expected: usize) -> Result<&[u8], ProtocolError> {
    let data = frame.data();
    if data.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            got: data.len(),
        });
    }
    Ok(data)
}

fn be_i16(b: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([b[at], b[at + 1]])
}

/// Decode a status broadcast. Returns `Ok(None)` for commands that carry no
/// telemetry we track.
pub fn decode_status(frame: &CanFrame) -> Result<Option<TelemetryDelta>, ProtocolError> {
    let delta = match frame.command() {
        c if c == CanCommand::Status1 as u8 => {
            let d = need(frame, 8)?;
            TelemetryDelta {
                speed_erpm: Some(i32::from_be_bytes([d[0], d[1], d[2], d[3]])),
                // deciamps on the wire
                motor_current: Some(be_i16(d, 4) as i32 * 10),
                ..Default::default()
            }
        }
        c if c == CanCommand::Status4 as u8 => {
            let d = need(frame, 6)?;
            TelemetryDelta {
                controller_temp: Some(be_i16(d, 0)),
                motor_temp: Some(be_i16(d, 2)),
                battery_current: Some(be_i16(d, 4) as i32 * 10),
                ..Default::default()
            }
        }
        c if c == CanCommand::Status5 as u8 => {
            let d = need(frame, 6)?;
            TelemetryDelta {
                // decivolts on the wire
                battery_voltage: Some(be_i16(d, 4) as i32 * 10),
                ..Default::default()
            }
        }
        c if c == CanCommand::Status7 as u8 => {
            let d = need(frame, 2)?;
            TelemetryDelta {
                state_of_charge: Some(d[0].min(100)),
                fault: Some(d[1]),
                ..Default::default()
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(delta))
}

/// A CAN bus shared by every node on it
pub trait CanBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Next pending frame sent by `node_id`
    fn receive_for(&mut self, node_id: u8) -> Result<Option<CanFrame>, LinkError>;

    /// Frames from `node_id` lost to a full receive queue
    fn dropped(&self, node_id: u8) -> u64;
}

/// Sorts received frames into bounded per-node queues
#[derive(Debug, Default)]
pub struct Demux {
    queues: HashMap<u8, VecDeque<CanFrame>>,
    dropped: HashMap<u8, u64>,
}

impl Demux {
    pub fn push(&mut self, frame: CanFrame) {
        let node_id = frame.node_id();
        let queue = self.queues.entry(node_id).or_default();
        if queue.len() >= QUEUE_DEPTH {
            queue.pop_front();
            *self.dropped.entry(node_id).or_default() += 1;
        }
        queue.push_back(frame);
    }

    pub fn pop(&mut self, node_id: u8) -> Option<CanFrame> {
        self.queues.get_mut(&node_id)?.pop_front()
    }

    pub fn dropped(&self, node_id: u8) -> u64 {
        self.dropped.get(&node_id).copied().unwrap_or(0)
    }
}

/// One VESC node on a shared bus
pub struct CanLink<B: CanBus + ?Sized> {
    bus: Rc<RefCell<B>>,
    node_id: u8,
}

impl<B: CanBus + ?Sized> CanLink<B> {
    pub fn new(bus: Rc<RefCell<B>>, node_id: u8) -> Self {
        Self { bus, node_id }
    }
}

impl<B: CanBus + ?Sized> VescLink for CanLink<B> {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        let Some(frame) = encode(self.node_id, command) else {
            return Ok(());
        };
        debug!("CAN tx node {} {:?}", self.node_id, command);
        self.bus.borrow_mut().transmit(&frame)
    }

    fn recv(&mut self) -> Result<Option<TelemetryDelta>, LinkError> {
        loop {
            let frame = self.bus.borrow_mut().receive_for(self.node_id)?;
            let Some(frame) = frame else {
                return Ok(None);
            };
            match decode_status(&frame) {
                Ok(Some(delta)) => return Ok(Some(delta)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "Node {}: bad status frame 0x{:08X}: {}",
                        self.node_id,
                        frame.raw_id(),
                        e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Status is broadcast on its own
    fn polls_status(&self) -> bool {
        false
    }

    fn rx_overruns(&self) -> u64 {
        self.bus.borrow().dropped(self.node_id)
    }
}
