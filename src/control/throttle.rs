// Throttle lever calibration: raw ADC -> normalized [0, 1000]

use serde::Serialize;

use crate::config::ThrottleConfig;

/// Full scale of a normalized throttle reading
pub const THROTTLE_MAX: u16 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleSample {
    /// Normalized reading in [0, 1000]
    pub value: u16,
    /// Raw ADC reading, only used for range checks
    pub raw: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    config: ThrottleConfig,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self { config }
    }

    pub fn error_threshold(&self) -> u16 {
        self.config.adc_error_threshold
    }

    pub fn sample(&self, raw: u16) -> ThrottleSample {
        let (lo, hi) = (self.config.adc_min as u32, self.config.adc_max as u32);
        let r = raw as u32;
        let value = if r <= lo {
            0
        } else if r >= hi {
            THROTTLE_MAX
        } else {
            ((r - lo) * THROTTLE_MAX as u32 / (hi - lo)) as u16
        };
        ThrottleSample { value, raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> Throttle {
        Throttle::new(ThrottleConfig {
            adc_min: 200,
            adc_max: 800,
            adc_error_threshold: 950,
        })
    }

    #[test]
    fn test_ends_of_travel() {
        assert_eq!(throttle().sample(0).value, 0);
        assert_eq!(throttle().sample(200).value, 0);
        assert_eq!(throttle().sample(800).value, 1000);
        assert_eq!(throttle().sample(900).value, 1000);
    }

    #[test]
    fn test_midpoint() {
        let s = throttle().sample(500);
        assert_eq!(s.value, 500);
        assert_eq!(s.raw, 500);
    }
}
