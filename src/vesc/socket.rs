// SocketCAN interface (can0, vcan0, ...) shared by every VESC on the bus
//
// The socket is non-blocking. Receiving drains whatever the kernel has
// queued into the per-node queues, then hands out one frame.

use socketcan::{CanSocket, EmbeddedFrame, Socket};
use std::io;
use tracing::{debug, info};

use super::can::{CanBus, CanFrame, Demux};
use crate::error::{LinkError, TransportError};

/// Most frames moved from the socket into the queues per receive call
const MAX_PUMP: usize = 256;

pub struct SocketBus {
    socket: CanSocket,
    demux: Demux,
}

impl SocketBus {
    pub fn open(interface: &str) -> Result<Self, TransportError> {
        info!("Opening SocketCAN interface {}", interface);
        let socket = CanSocket::open(interface)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            demux: Demux::default(),
        })
    }

    fn pump(&mut self) -> Result<(), TransportError> {
        for _ in 0..MAX_PUMP {
            match self.socket.read_frame() {
                Ok(frame) => match CanFrame::from_frame(&frame) {
                    Some(frame) => self.demux.push(frame),
                    None => debug!("SocketCAN rx ignored {:?}", frame.id()),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl CanBus for SocketBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let out = socketcan::CanFrame::new(frame.id(), frame.data()).ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame not representable on SocketCAN",
            ))
        })?;
        self.socket.write_frame(&out).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock => TransportError::Busy,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(e),
        })
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
