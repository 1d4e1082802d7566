// Speed dependent current limits
//
// Each curve holds `max` up to the 5 km/h anchor, falls linearly to `min`
// at `min_speed_kmh` and stays there.

use crate::config::{CurveConfig, LIMIT_ANCHOR_KMH, LimitsConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentLimitCurve {
    pub max: f32,
    pub min: f32,
    pub min_speed_kmh: f32,
}

impl From<&CurveConfig> for CurrentLimitCurve {
    fn from(c: &CurveConfig) -> Self {
        Self {
            max: c.max,
            min: c.min,
            min_speed_kmh: c.min_speed_kmh,
        }
    }
}

impl CurrentLimitCurve {
    /// Limit (amps, magnitude) at a wheel speed. Direction is ignored.
    pub fn limit(&self, speed_kmh: f32) -> f32 {
        let speed = speed_kmh.abs();
        let value = if !(speed > LIMIT_ANCHOR_KMH) {
            self.max
        } else if speed >= self.min_speed_kmh {
            self.min
        } else {
            let span = self.min_speed_kmh - LIMIT_ANCHOR_KMH;
            self.max - (self.max - self.min) * (speed - LIMIT_ANCHOR_KMH) / span
        };
        value.max(self.min).min(self.max)
    }
}

/// Limits for both sides of one motor, signed: min is the regen side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorLimits {
    pub motor_min: f32,
    pub motor_max: f32,
    pub battery_min: f32,
    pub battery_max: f32,
}

/// The four curves of one motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitCurves {
    motor_forward: CurrentLimitCurve,
    motor_regen: CurrentLimitCurve,
    battery_forward: CurrentLimitCurve,
    battery_regen: CurrentLimitCurve,
}

impl From<&LimitsConfig> for LimitCurves {
    fn from(c: &LimitsConfig) -> Self {
        Self {
            motor_forward: (&c.motor_forward).into(),
            motor_regen: (&c.motor_regen).into(),
            battery_forward: (&c.battery_forward).into(),
            battery_regen: (&c.battery_regen).into(),
        }
    }
}

impl LimitCurves {
    pub fn at(&self, speed_kmh: f32) -> MotorLimits {
        MotorLimits {
            motor_min: -self.motor_regen.limit(speed_kmh),
            motor_max: self.motor_forward.limit(speed_kmh),
            battery_min: -self.battery_regen.limit(speed_kmh),
            battery_max: self.battery_forward.limit(speed_kmh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> CurrentLimitCurve {
        CurrentLimitCurve {
            max: 60.0,
            min: 20.0,
            min_speed_kmh: 25.0,
        }
    }

    #[test]
    fn test_anchor_gives_max() {
        assert_eq!(curve().limit(5.0), 60.0);
        assert_eq!(curve().limit(0.0), 60.0);
        assert_eq!(curve().limit(3.2), 60.0);
    }

    #[test]
    fn test_above_min_speed_gives_min() {
        assert_eq!(curve().limit(25.0), 20.0);
        assert_eq!(curve().limit(60.0), 20.0);
    }

    #[test]
    fn test_linear_between() {
        // halfway between 5 and 25 km/h
        assert!((curve().limit(15.0) - 40.0).abs() < 1e-4);
        assert!((curve().limit(10.0) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_output_stays_in_range() {
        let c = curve();
        let mut speed = 0.0;
        while speed < 40.0 {
            let l = c.limit(speed);
            assert!(l >= c.min && l <= c.max, "{} at {}", l, speed);
            speed += 0.37;
        }
    }

    #[test]
    fn test_monotonic_non_increasing() {
        let c = curve();
        let mut prev = c.limit(0.0);
        for tenth in 1..400 {
            let l = c.limit(tenth as f32 / 10.0);
            assert!(l <= prev);
            prev = l;
        }
    }

    #[test]
    fn test_reverse_speed_uses_magnitude() {
        assert_eq!(curve().limit(-30.0), 20.0);
    }

    #[test]
    fn test_nan_speed_gives_max() {
        assert_eq!(curve().limit(f32::NAN), 60.0);
    }

    #[test]
    fn test_signed_limits() {
        let curves = LimitCurves::from(&LimitsConfig::default());
        let l = curves.at(0.0);
        assert_eq!(l.motor_max, 60.0);
        assert_eq!(l.motor_min, -30.0);
        assert_eq!(l.battery_max, 30.0);
        assert_eq!(l.battery_min, -10.0);
        assert!(l.motor_min <= l.motor_max && l.battery_min <= l.battery_max);
    }
}
