// VESC motor controller protocol
//
// Provides:
// - Command set shared by both framings
// - UART framing (start byte, length, payload, CRC16, end byte)
// - CAN framing (node id + command packed into an extended id)
// - CAN transports: SocketCAN interface, SLCAN adapter on a serial port
// - A simulated controller for bench runs without hardware

pub mod can;
pub mod crc;
pub mod sim;
pub mod slcan;
pub mod socket;
pub mod uart;

use serde::Serialize;

use crate::error::{LinkError, TransportError};

pub use can::{CanBus, CanFrame, CanLink};
pub use sim::SimLink;
pub use slcan::SlcanBus;
pub use socket::SocketBus;
pub use uart::UartLink;

/// Commands understood by the motor controller.
///
/// Currents are carried in milliamps and speed in ERPM, the units that go
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetCurrent(i32),
    SetCurrentBrake(i32),
    SetRpm(i32),
    SetCurrentLimits { min: i32, max: i32 },
    SetBatteryCurrentLimits { min: i32, max: i32 },
    Heartbeat,
    /// Ask for a status report. CAN controllers broadcast status on their
    /// own, so only the UART framing puts this on the wire.
    GetValues,
}

impl Command {
    pub fn set_current(amps: f32) -> Self {
        Command::SetCurrent(amps_to_milliamps(amps))
    }

    pub fn set_current_brake(amps: f32) -> Self {
        Command::SetCurrentBrake(amps_to_milliamps(amps))
    }

    pub fn set_rpm(erpm: i32) -> Self {
        Command::SetRpm(erpm)
    }

    pub fn set_current_limits(min_amps: f32, max_amps: f32) -> Self {
        Command::SetCurrentLimits {
            min: amps_to_milliamps(min_amps),
            max: amps_to_milliamps(max_amps),
        }
    }

    pub fn set_battery_current_limits(min_amps: f32, max_amps: f32) -> Self {
        Command::SetBatteryCurrentLimits {
            min: amps_to_milliamps(min_amps),
            max: amps_to_milliamps(max_amps),
        }
    }

    /// The same command with every current multiplied by `factor`.
    ///
    /// Speed targets pass through unchanged: motors sharing a vehicle roll
    /// at the same road speed, so a scaled speed loop would brake against
    /// the others.
    pub fn scaled(&self, factor: f32) -> Self {
        let s = |v: i32| (v as f32 * factor).round() as i32;
        match *self {
            Command::SetCurrent(ma) => Command::SetCurrent(s(ma)),
            Command::SetCurrentBrake(ma) => Command::SetCurrentBrake(s(ma)),
            Command::SetCurrentLimits { min, max } => Command::SetCurrentLimits {
                min: s(min),
                max: s(max),
            },
            Command::SetBatteryCurrentLimits { min, max } => Command::SetBatteryCurrentLimits {
                min: s(min),
                max: s(max),
            },
            other => other,
        }
    }
}

/// Float amps to wire milliamps. `as` saturates, NaN becomes 0.
pub fn amps_to_milliamps(amps: f32) -> i32 {
    (amps * 1000.0).round() as i32
}

/// Fields carried by one decoded status frame. Absent fields were not part
/// of the frame and leave the stored telemetry untouched.
///
/// Units: currents in centi-amps, voltage in centi-volts, temperatures in
/// deci-degrees Celsius, state of charge in percent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryDelta {
    pub speed_erpm: Option<i32>,
    pub motor_current: Option<i32>,
    pub battery_current: Option<i32>,
    pub controller_temp: Option<i16>,
    pub motor_temp: Option<i16>,
    pub battery_voltage: Option<i32>,
    pub state_of_charge: Option<u8>,
    pub fault: Option<u8>,
}

/// Connection to one physical motor controller.
///
/// Sends are fire-and-forget: a failure means the frame was dropped and
/// nothing else happens. `recv` never blocks for longer than the link's
/// short read timeout and returns `Ok(None)` once nothing is pending.
pub trait VescLink {
    fn send(&mut self, command: &Command) -> Result<(), TransportError>;

    fn recv(&mut self) -> Result<Option<TelemetryDelta>, LinkError>;

    /// Whether status has to be requested with `GetValues`
    fn polls_status(&self) -> bool {
        true
    }

    /// Status frames lost before they could be read
    fn rx_overruns(&self) -> u64 {
        0
    }
}

impl<L: VescLink + ?Sized> VescLink for Box<L> {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        (**self).send(command)
    }

    fn recv(&mut self) -> Result<Option<TelemetryDelta>, LinkError> {
        (**self).recv()
    }

    fn polls_status(&self) -> bool {
        (**self).polls_status()
    }

    fn rx_overruns(&self) -> u64 {
        (**self).rx_overruns()
    }
}

/// Human readable name of a VESC fault code
pub fn fault_name(code: u8) -> &'static str {
    match code {
        0 => "none",
        1 => "over_voltage",
        2 => "under_voltage",
        3 => "drv",
        4 => "abs_over_current",
        5 => "over_temp_fet",
        6 => "over_temp_motor",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amps_to_milliamps() {
        assert_eq!(amps_to_milliamps(10.0), 10_000);
        assert_eq!(amps_to_milliamps(-2.5), -2_500);
        assert_eq!(amps_to_milliamps(f32::NAN), 0);
    }

    #[test]
    fn test_scaled_command() {
        let cmd = Command::set_current_limits(-10.0, 40.0).scaled(0.5);
        assert_eq!(cmd, Command::SetCurrentLimits { min: -5_000, max: 20_000 });
        assert_eq!(Command::Heartbeat.scaled(0.5), Command::Heartbeat);
        assert_eq!(Command::SetRpm(1000).scaled(1.2), Command::SetRpm(1000));
    }

    #[test]
    fn test_fault_names() {
        assert_eq!(fault_name(0), "none");
        assert_eq!(fault_name(6), "over_temp_motor");
        assert_eq!(fault_name(200), "unknown");
    }
}
