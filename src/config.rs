// Task periods, topics, and the static vehicle configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

// Task periods
pub const CONTROL_PERIOD: Duration = Duration::from_millis(20);
pub const LIMITS_PERIOD: Duration = Duration::from_millis(100);
pub const INGEST_PERIOD: Duration = Duration::from_millis(50);
pub const PUBLISH_PERIOD: Duration = Duration::from_millis(200);

// Time slice each channel may spend draining telemetry per ingestion tick
pub const INGEST_BUDGET: Duration = Duration::from_millis(4);

// Input frames older than this count as lost (throttle zero, brake on)
pub const INPUT_TIMEOUT: Duration = Duration::from_millis(250);

// Watchdog timeout
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(1);

// Zenoh topics
pub const TOPIC_INPUT: &str = "ebike/input/throttle"; // raw throttle/brake from the input board
pub const TOPIC_DISPLAY_CMD: &str = "ebike/display/command"; // enable + buttons from the display
pub const TOPIC_TELEMETRY: &str = "ebike/motor/telemetry"; // snapshot to the display
pub const TOPIC_HEALTH: &str = "ebike/motor/health"; // health status

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ebike/motor.json";

/// Below this wheel speed the current limits sit at their maximum
pub const LIMIT_ANCHOR_KMH: f32 = 5.0;

/// Cruise control only arms above this wheel speed
pub const CRUISE_MIN_SPEED_KMH: f32 = 4.0;

/// Zero-current commands sent to every motor on a safety trip
pub const EMERGENCY_STOP_REPEATS: usize = 3;

/// How a motor controller is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkConfig {
    Uart {
        port: String,
        #[serde(default = "default_uart_baudrate")]
        baudrate: u32,
    },
    Can {
        node_id: u8,
    },
    Sim,
}

fn default_uart_baudrate() -> u32 {
    crate::vesc::uart::DEFAULT_BAUDRATE
}

/// One current-limit curve: `max` up to the anchor speed, `min` from
/// `min_speed_kmh` on, linear in between. Amps, magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveConfig {
    pub max: f32,
    pub min: f32,
    pub min_speed_kmh: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub motor_forward: CurveConfig,
    pub motor_regen: CurveConfig,
    pub battery_forward: CurveConfig,
    pub battery_regen: CurveConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            motor_forward: CurveConfig {
                max: 60.0,
                min: 20.0,
                min_speed_kmh: 35.0,
            },
            motor_regen: CurveConfig {
                max: 30.0,
                min: 10.0,
                min_speed_kmh: 35.0,
            },
            battery_forward: CurveConfig {
                max: 30.0,
                min: 10.0,
                min_speed_kmh: 35.0,
            },
            battery_regen: CurveConfig {
                max: 10.0,
                min: 3.0,
                min_speed_kmh: 35.0,
            },
        }
    }
}

/// Second physical motor driven by the same channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryConfig {
    pub link: LinkConfig,
    #[serde(default = "one")]
    pub factor: f32,
}

fn one() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub name: String,
    pub pole_pairs: u32,
    pub wheel_radius_m: f32,
    pub max_erpm: i32,
    pub link: LinkConfig,
    #[serde(default = "one")]
    pub factor: f32,
    #[serde(default)]
    pub secondary: Option<SecondaryConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            name: "rear".to_string(),
            pole_pairs: 15,
            wheel_radius_m: 0.279,
            max_erpm: 13263,
            link: LinkConfig::Sim,
            factor: 1.0,
            secondary: None,
            limits: LimitsConfig::default(),
        }
    }
}

/// Raw ADC calibration of one throttle lever
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub adc_min: u16,
    pub adc_max: u16,
    /// Readings above this mean a broken sensor or wiring
    pub adc_error_threshold: u16,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            adc_min: 180,
            adc_max: 830,
            adc_error_threshold: 950,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Speed targets below this are forced to zero
    pub dead_zone_erpm: i32,
    /// Largest speed target increase per control tick
    pub ramp_up_erpm: i32,
    /// Largest speed target decrease per control tick
    pub ramp_down_erpm: i32,
    /// Summed motor current below this (amps, negative) means regen
    pub regen_threshold_amps: f32,
    pub cruise_enabled: bool,
    /// Button bit set by the display on a long press
    pub cruise_long_press_mask: u16,
    /// Button bit set by the display on a short press
    pub cruise_short_press_mask: u16,
    /// Control ticks ignored after a button edge
    pub button_debounce_ticks: u8,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            dead_zone_erpm: 150,
            ramp_up_erpm: 250,
            ramp_down_erpm: 600,
            regen_threshold_amps: -1.0,
            cruise_enabled: true,
            cruise_long_press_mask: 0x0001,
            cruise_short_press_mask: 0x0002,
            button_debounce_ticks: 5,
        }
    }
}

/// Host side of the CAN bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanAdapter {
    /// Kernel SocketCAN interface, `port` is the interface name
    #[default]
    Socket,
    /// Lawicel ASCII adapter, `port` is the serial device
    Slcan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfig {
    #[serde(default)]
    pub adapter: CanAdapter,
    pub port: String,
    /// Only used by SLCAN adapters; SocketCAN interfaces are configured
    /// by the system
    #[serde(default = "default_can_bitrate")]
    pub bitrate: u32,
}

fn default_can_bitrate() -> u32 {
    crate::vesc::slcan::DEFAULT_BITRATE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleConfig {
    pub motors: Vec<MotorConfig>,
    #[serde(default = "default_throttles")]
    pub throttles: Vec<ThrottleConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub can: Option<CanConfig>,
}

fn default_throttles() -> Vec<ThrottleConfig> {
    vec![ThrottleConfig::default()]
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            motors: vec![MotorConfig::default()],
            throttles: default_throttles(),
            control: ControlConfig::default(),
            can: None,
        }
    }
}

impl VehicleConfig {
    /// Read, parse and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: VehicleConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Run once at startup. Nothing is commanded before this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.motors.is_empty() {
            return Err(ConfigError::Invalid("no motors configured".into()));
        }
        if self.throttles.is_empty() {
            return Err(ConfigError::Invalid("no throttle configured".into()));
        }
        for motor in &self.motors {
            motor.validate(self.can.is_some())?;
        }
        for (i, t) in self.throttles.iter().enumerate() {
            if t.adc_min >= t.adc_max {
                return Err(ConfigError::Invalid(format!(
                    "throttle {}: adc_min {} must be below adc_max {}",
                    i, t.adc_min, t.adc_max
                )));
            }
            if t.adc_error_threshold <= t.adc_max {
                return Err(ConfigError::Invalid(format!(
                    "throttle {}: adc_error_threshold {} must be above adc_max {}",
                    i, t.adc_error_threshold, t.adc_max
                )));
            }
        }

        let c = &self.control;
        if c.dead_zone_erpm < 0 || c.ramp_up_erpm <= 0 || c.ramp_down_erpm <= 0 {
            return Err(ConfigError::Invalid(
                "dead zone must be >= 0 and ramp steps > 0".into(),
            ));
        }
        if !(c.regen_threshold_amps <= 0.0) {
            return Err(ConfigError::Invalid(
                "regen_threshold_amps must be zero or negative".into(),
            ));
        }
        if let Some(can) = &self.can {
            if can.adapter == CanAdapter::Slcan
                && crate::vesc::slcan::bitrate_code(can.bitrate).is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "unsupported CAN bitrate {}",
                    can.bitrate
                )));
            }
        }
        Ok(())
    }
}

impl MotorConfig {
    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidMotor {
            motor: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self, has_can_bus: bool) -> Result<(), ConfigError> {
        if self.pole_pairs == 0 {
            return Err(self.invalid("pole_pairs must be > 0"));
        }
        if !(self.wheel_radius_m > 0.0) {
            return Err(self.invalid("wheel_radius_m must be > 0"));
        }
        if self.max_erpm <= 0 {
            return Err(self.invalid("max_erpm must be > 0"));
        }

        let mut links = vec![(&self.link, self.factor)];
        if let Some(secondary) = &self.secondary {
            links.push((&secondary.link, secondary.factor));
        }
        for (link, factor) in links {
            if !(factor > 0.0 && factor <= 2.0) {
                return Err(self.invalid(format!("factor {} outside (0, 2]", factor)));
            }
            if matches!(link, LinkConfig::Can { .. }) && !has_can_bus {
                return Err(self.invalid("CAN link configured without a `can` section"));
            }
        }

        let curves = [
            ("motor_forward", &self.limits.motor_forward),
            ("motor_regen", &self.limits.motor_regen),
            ("battery_forward", &self.limits.battery_forward),
            ("battery_regen", &self.limits.battery_regen),
        ];
        for (field, curve) in curves {
            if curve.min > curve.max {
                return Err(ConfigError::MinExceedsMax {
                    motor: self.name.clone(),
                    field,
                    min: curve.min,
                    max: curve.max,
                });
            }
            if curve.min < 0.0 {
                return Err(self.invalid(format!("{}: limits are magnitudes, min < 0", field)));
            }
            if !(curve.min_speed_kmh > LIMIT_ANCHOR_KMH) {
                return Err(self.invalid(format!(
                    "{}: min_speed_kmh must be above {} km/h",
                    field, LIMIT_ANCHOR_KMH
                )));
            }
        }
        Ok(())
    }
}
