// Safety checks around the control loop

use tracing::error;

use super::throttle::ThrottleSample;
use crate::config::EMERGENCY_STOP_REPEATS;
use crate::error::SafetyFault;
use crate::motor::MotorChannel;

pub struct SafetyMonitor {
    /// Over-range threshold per throttle lever
    thresholds: Vec<u16>,
    /// Summed motor current (centi-amps) below which we are regenerating
    regen_threshold: i32,
    fault: Option<SafetyFault>,
}

impl SafetyMonitor {
    pub fn new(thresholds: Vec<u16>, regen_threshold_amps: f32) -> Self {
        Self {
            thresholds,
            regen_threshold: (regen_threshold_amps * 100.0).round() as i32,
            fault: None,
        }
    }

    pub fn fault(&self) -> Option<&SafetyFault> {
        self.fault.as_ref()
    }

    /// First lever whose raw reading is above its threshold
    pub fn check_throttle(&self, samples: &[ThrottleSample]) -> Result<(), SafetyFault> {
        for (lever, (sample, &threshold)) in samples.iter().zip(&self.thresholds).enumerate() {
            if sample.raw > threshold {
                return Err(SafetyFault::ThrottleOverRange {
                    lever,
                    raw: sample.raw,
                    threshold,
                });
            }
        }
        Ok(())
    }

    /// Zero every motor, remember the fault and hand it back for the caller
    /// to stop on.
    pub fn trip(&mut self, fault: SafetyFault, motors: &mut [MotorChannel]) -> SafetyFault {
        error!("Safety fault: {}. Stopping all motors", fault);
        emergency_stop(motors);
        self.fault = Some(fault.clone());
        fault
    }

    /// True while the motors are braking back into the battery
    pub fn regen_active(&self, motors: &[MotorChannel]) -> bool {
        let total: i32 = motors
            .iter()
            .flat_map(|m| m.all_telemetry())
            .map(|t| t.motor_current)
            .sum();
        total < self.regen_threshold
    }
}

/// Command zero current to every motor, repeated so a single lost frame
/// cannot leave a motor driving
pub fn emergency_stop(motors: &mut [MotorChannel]) {
    for _ in 0..EMERGENCY_STOP_REPEATS {
        for motor in motors.iter_mut() {
            if let Err(e) = motor.set_motor_current_amps(0.0) {
                error!("{}: emergency stop frame dropped: {}", motor.name(), e);
            }
        }
    }
}
