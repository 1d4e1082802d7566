// Live telemetry and control targets of a motor channel

use serde::Serialize;

use super::kinematics::erpm_to_kmh;
use crate::vesc::TelemetryDelta;

/// Last good status of one physical motor.
///
/// Units: currents in centi-amps (negative while regenerating), voltage in
/// centi-volts, temperatures in deci-degrees Celsius.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MotorTelemetry {
    pub speed_erpm: i32,
    pub wheel_speed_kmh: f32,
    pub motor_current: i32,
    pub battery_current: i32,
    pub controller_temp: i16,
    pub motor_temp: i16,
    pub battery_voltage: i32,
    pub state_of_charge: u8,
    pub fault: u8,
}

impl MotorTelemetry {
    /// Overwrite the fields carried by a verified frame
    pub fn apply(&mut self, delta: &TelemetryDelta, pole_pairs: u32, wheel_radius_m: f32) {
        if let Some(erpm) = delta.speed_erpm {
            self.speed_erpm = erpm;
            self.wheel_speed_kmh = erpm_to_kmh(erpm, pole_pairs, wheel_radius_m);
        }
        if let Some(v) = delta.motor_current {
            self.motor_current = v;
        }
        if let Some(v) = delta.battery_current {
            self.battery_current = v;
        }
        if let Some(v) = delta.controller_temp {
            self.controller_temp = v;
        }
        if let Some(v) = delta.motor_temp {
            self.motor_temp = v;
        }
        if let Some(v) = delta.battery_voltage {
            self.battery_voltage = v;
        }
        if let Some(v) = delta.state_of_charge {
            self.state_of_charge = v;
        }
        if let Some(v) = delta.fault {
            self.fault = v;
        }
    }
}

/// Setpoints decided by the control loop. Amps for limits, ERPM for speed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ControlTargets {
    pub speed_erpm: i32,
    pub motor_current_min: f32,
    pub motor_current_max: f32,
    pub battery_current_min: f32,
    pub battery_current_max: f32,
}

/// Per-link traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub tx_ok: u64,
    pub tx_dropped: u64,
    pub rx_frames: u64,
    pub rx_rejected: u64,
    pub rx_errors: u64,
    /// Frames the bus dropped before this link read them
    pub rx_overrun: u64,
}

impl std::ops::Add for LinkStats {
    type Output = LinkStats;

    fn add(self, o: LinkStats) -> LinkStats {
        LinkStats {
            tx_ok: self.tx_ok + o.tx_ok,
            tx_dropped: self.tx_dropped + o.tx_dropped,
            rx_frames: self.rx_frames + o.rx_frames,
            rx_rejected: self.rx_rejected + o.rx_rejected,
            rx_errors: self.rx_errors + o.rx_errors,
            rx_overrun: self.rx_overrun + o.rx_overrun,
        }
    }
}
