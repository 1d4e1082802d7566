// State shared by the periodic tasks
//
// Everything lives in one `Vehicle` passed by `&mut` to each task. Tasks
// run one at a time on a single thread and never await while mutating it,
// so no locking is needed.
//
// Ownership: telemetry is written only by `ingest` (through the channels'
// decoders), targets only by the control loop, remote input and input
// frames only by the display link.

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::control::CruiseState;
use crate::messages::{InputFrame, MotorSnapshot, RuntimeHealth, TelemetrySnapshot};
use crate::motor::{ControlTargets, MotorChannel};

/// Latest values delivered by the display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteInput {
    pub motor_enable: bool,
    pub buttons: u16,
}

pub struct Vehicle {
    /// Primary (rear) channel first; its wheel is the speed reference
    pub motors: Vec<MotorChannel>,
    pub targets: ControlTargets,
    pub remote: RemoteInput,
    pub regen_active: bool,
    input: InputFrame,
    input_at: Option<Instant>,
}

impl Vehicle {
    pub fn new(motors: Vec<MotorChannel>) -> Self {
        Self {
            motors,
            targets: ControlTargets::default(),
            remote: RemoteInput::default(),
            regen_active: false,
            input: InputFrame::default(),
            input_at: None,
        }
    }

    /// Display link boundary: motor enable flag and button bitmask
    pub fn on_receive(&mut self, motor_enable: bool, buttons: u16) {
        if motor_enable != self.remote.motor_enable {
            info!("Motors {}", if motor_enable { "enabled" } else { "disabled" });
        }
        self.remote = RemoteInput {
            motor_enable,
            buttons,
        };
    }

    pub fn on_input(&mut self, frame: InputFrame) {
        self.input = frame;
        self.input_at = Some(Instant::now());
    }

    /// Latest input frame, or `None` if nothing arrived within `timeout`
    pub fn fresh_input(&self, timeout: Duration) -> Option<&InputFrame> {
        match self.input_at {
            Some(at) if at.elapsed() <= timeout => Some(&self.input),
            _ => None,
        }
    }

    /// Wheel speed of the primary motor. The front wheel may skid and is
    /// never used as the reference.
    pub fn primary_speed_kmh(&self) -> f32 {
        self.motors.first().map_or(0.0, |m| m.wheel_speed_kmh())
    }

    pub fn primary_max_erpm(&self) -> i32 {
        self.motors.first().map_or(0, |m| m.config().max_erpm)
    }

    /// Apply whatever telemetry is already waiting, without polling
    pub fn drain_telemetry(&mut self, budget: Duration) -> usize {
        self.motors
            .iter_mut()
            .map(|m| m.update_motor_data(budget))
            .sum()
    }

    /// Drain pending telemetry on every channel, then poll for the next
    /// report. Returns the number of frames applied.
    pub fn ingest(&mut self, budget: Duration) -> usize {
        let applied = self.drain_telemetry(budget);
        for motor in self.motors.iter_mut() {
            if let Err(e) = motor.request_status() {
                debug!("{}: status request dropped: {}", motor.name(), e);
            }
        }
        applied
    }

    pub fn snapshot(
        &self,
        cruise: CruiseState,
        brake: bool,
        health: RuntimeHealth,
    ) -> TelemetrySnapshot {
        TelemetrySnapshot {
            wheel_speed_kmh: self.primary_speed_kmh(),
            channels: self
                .motors
                .iter()
                .map(|m| MotorSnapshot {
                    name: m.name().to_string(),
                    motors: m.all_telemetry().cloned().collect(),
                    link: m.stats(),
                })
                .collect(),
            targets: self.targets,
            cruise,
            regen_active: self.regen_active,
            brake,
            health,
        }
    }
}
