// Cruise control
//
// Idle -> WaitArm once the motors are enabled.
// WaitArm -> Active on a long-press edge while rolling above 4 km/h; the
// throttle at that moment is latched and replaces the live throttle.
// Active -> WaitArm on brake, a short-press edge, or the rider pushing the
// throttle more than 15% past the latched value.
// Disabling the motors always returns to Idle.

use serde::Serialize;
use tracing::info;

use crate::config::{CRUISE_MIN_SPEED_KMH, ControlConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CruiseState {
    #[default]
    Idle,
    WaitArm,
    Active,
}

/// Everything cruise control looks at in one tick
#[derive(Debug, Clone, Copy)]
pub struct CruiseInput {
    pub throttle: u16,
    pub brake: bool,
    pub buttons: u16,
    pub wheel_speed_kmh: f32,
    pub motor_enable: bool,
}

#[derive(Debug, Clone)]
pub struct CruiseControl {
    enabled: bool,
    long_press_mask: u16,
    short_press_mask: u16,
    debounce_ticks: u8,
    state: CruiseState,
    latched: u16,
    last_buttons: u16,
    holdoff: u8,
}

impl CruiseControl {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            enabled: config.cruise_enabled,
            long_press_mask: config.cruise_long_press_mask,
            short_press_mask: config.cruise_short_press_mask,
            debounce_ticks: config.button_debounce_ticks,
            state: CruiseState::Idle,
            latched: 0,
            last_buttons: 0,
            holdoff: 0,
        }
    }

    pub fn state(&self) -> CruiseState {
        self.state
    }

    pub fn latched(&self) -> u16 {
        self.latched
    }

    /// Bits that flipped since the previous tick, or none while debouncing
    fn edges(&mut self, buttons: u16) -> u16 {
        let changed = buttons ^ self.last_buttons;
        self.last_buttons = buttons;
        if self.holdoff > 0 {
            self.holdoff -= 1;
            return 0;
        }
        if changed != 0 {
            self.holdoff = self.debounce_ticks;
        }
        changed
    }

    fn cancel(&mut self, reason: &str) {
        info!("Cruise cancelled ({}), latched {}", reason, self.latched);
        self.state = CruiseState::WaitArm;
    }

    /// Throttle value to use this tick
    pub fn update(&mut self, input: &CruiseInput) -> u16 {
        let edges = self.edges(input.buttons);

        if !self.enabled {
            return input.throttle;
        }
        if !input.motor_enable {
            self.state = CruiseState::Idle;
            return input.throttle;
        }

        match self.state {
            CruiseState::Idle => {
                self.state = CruiseState::WaitArm;
                input.throttle
            }
            CruiseState::WaitArm => {
                if edges & self.long_press_mask != 0
                    && input.wheel_speed_kmh > CRUISE_MIN_SPEED_KMH
                {
                    self.latched = input.throttle;
                    self.state = CruiseState::Active;
                    info!(
                        "Cruise active at {:.1} km/h, throttle {}",
                        input.wheel_speed_kmh, self.latched
                    );
                    self.latched
                } else {
                    input.throttle
                }
            }
            CruiseState::Active => {
                if input.brake {
                    self.cancel("brake");
                    input.throttle
                } else if edges & self.short_press_mask != 0 {
                    self.cancel("button");
                    input.throttle
                } else if input.throttle as u32 * 100 > self.latched as u32 * 115 {
                    self.cancel("throttle override");
                    input.throttle
                } else {
                    self.latched
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: u16 = 0x0001;
    const SHORT: u16 = 0x0002;

    fn input(throttle: u16, buttons: u16) -> CruiseInput {
        CruiseInput {
            throttle,
            brake: false,
            buttons,
            wheel_speed_kmh: 10.0,
            motor_enable: true,
        }
    }

    fn armed() -> CruiseControl {
        let mut cruise = CruiseControl::new(&ControlConfig {
            button_debounce_ticks: 0,
            ..ControlConfig::default()
        });
        cruise.update(&input(0, 0));
        assert_eq!(cruise.state(), CruiseState::WaitArm);
        cruise
    }

    #[test]
    fn test_long_press_latches_throttle() {
        let mut cruise = armed();
        assert_eq!(cruise.update(&input(420, LONG)), 420);
        assert_eq!(cruise.state(), CruiseState::Active);
        assert_eq!(cruise.latched(), 420);

        // Live throttle is ignored while active
        assert_eq!(cruise.update(&input(0, LONG)), 420);
        assert_eq!(cruise.update(&input(300, LONG)), 420);
    }

    #[test]
    fn test_brake_cancels() {
        let mut cruise = armed();
        cruise.update(&input(420, LONG));
        let mut braking = input(0, LONG);
        braking.brake = true;
        assert_eq!(cruise.update(&braking), 0);
        assert_eq!(cruise.state(), CruiseState::WaitArm);
    }

    #[test]
    fn test_falling_edge_also_arms() {
        let mut c = CruiseControl::new(&ControlConfig {
            button_debounce_ticks: 0,
            ..ControlConfig::default()
        });
        c.update(&input(0, LONG)); // Idle -> WaitArm, bit already high
        assert_eq!(c.update(&input(350, 0)), 350);
        assert_eq!(c.state(), CruiseState::Active);
    }

    #[test]
    fn test_too_slow_does_not_arm() {
        let mut cruise = armed();
        let mut slow = input(420, LONG);
        slow.wheel_speed_kmh = 3.9;
        assert_eq!(cruise.update(&slow), 420);
        assert_eq!(cruise.state(), CruiseState::WaitArm);
    }

    #[test]
    fn test_short_press_cancels() {
        let mut cruise = armed();
        cruise.update(&input(420, LONG));
        cruise.update(&input(0, LONG | SHORT));
        assert_eq!(cruise.state(), CruiseState::WaitArm);
    }

    #[test]
    fn test_throttle_override_threshold() {
        let mut cruise = armed();
        cruise.update(&input(400, LONG));
        // 460 is exactly 1.15x, not above it
        assert_eq!(cruise.update(&input(460, LONG)), 400);
        assert_eq!(cruise.state(), CruiseState::Active);
        assert_eq!(cruise.update(&input(461, LONG)), 461);
        assert_eq!(cruise.state(), CruiseState::WaitArm);
    }

    #[test]
    fn test_disable_resets_to_idle() {
        let mut cruise = armed();
        cruise.update(&input(400, LONG));
        let mut off = input(400, LONG);
        off.motor_enable = false;
        cruise.update(&off);
        assert_eq!(cruise.state(), CruiseState::Idle);
    }

    #[test]
    fn test_debounce_suppresses_edges() {
        let mut cruise = CruiseControl::new(&ControlConfig {
            button_debounce_ticks: 2,
            ..ControlConfig::default()
        });
        cruise.update(&input(0, 0));
        // Edge arms, then short press inside the hold-off is ignored
        cruise.update(&input(400, LONG));
        assert_eq!(cruise.state(), CruiseState::Active);
        cruise.update(&input(0, LONG | SHORT));
        assert_eq!(cruise.state(), CruiseState::Active);
        cruise.update(&input(0, LONG));
        assert_eq!(cruise.state(), CruiseState::Active);
        // Hold-off over, the next short press counts
        cruise.update(&input(0, LONG | SHORT));
        assert_eq!(cruise.state(), CruiseState::WaitArm);
    }

    #[test]
    fn test_feature_disabled_passes_through() {
        let mut cruise = CruiseControl::new(&ControlConfig {
            cruise_enabled: false,
            ..ControlConfig::default()
        });
        assert_eq!(cruise.update(&input(400, 0)), 400);
        assert_eq!(cruise.update(&input(300, LONG)), 300);
        assert_eq!(cruise.state(), CruiseState::Idle);
    }
}
