// The periodic control decision
//
// One tick: sample levers -> range check -> cruise -> map to ERPM -> ramp
// -> brake / enable overrides -> command every channel -> feed watchdog.

use tracing::{debug, warn};

use super::cruise::{CruiseControl, CruiseInput, CruiseState};
use super::limits::LimitCurves;
use super::ramp::RampLimiter;
use super::safety::SafetyMonitor;
use super::throttle::{THROTTLE_MAX, Throttle, ThrottleSample};
use crate::config::{ControlConfig, VehicleConfig};
use crate::error::{SafetyFault, TransportError};
use crate::messages::InputFrame;
use crate::motor::MotorChannel;
use crate::state::Vehicle;
use crate::watchdog::Watchdog;

/// Linear throttle -> speed mapping, truncating, clamped to [0, max_erpm]
pub fn throttle_to_erpm(throttle: u16, max_erpm: i32) -> i32 {
    let t = throttle.min(THROTTLE_MAX) as i64;
    (t * max_erpm.max(0) as i64 / THROTTLE_MAX as i64) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Closed-loop speed command
    Speed,
    /// Zero target, zero current
    Coast,
    Brake,
    Disabled,
}

/// What one tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub mode: DriveMode,
    /// Lever value after cruise control
    pub throttle: u16,
    pub target_erpm: i32,
    /// Every channel accepted its command and the watchdog was fed
    pub fed: bool,
}

pub struct ControlLoop {
    config: ControlConfig,
    throttles: Vec<Throttle>,
    curves: Vec<LimitCurves>,
    safety: SafetyMonitor,
    cruise: CruiseControl,
    ramp: RampLimiter,
    watchdog: Box<dyn Watchdog>,
    input_stale: bool,
    lever_mismatch: bool,
    brake: bool,
}

impl ControlLoop {
    pub fn new(config: &VehicleConfig, watchdog: Box<dyn Watchdog>) -> Self {
        let throttles: Vec<Throttle> = config.throttles.iter().copied().map(Throttle::new).collect();
        let thresholds = throttles.iter().map(|t| t.error_threshold()).collect();
        Self {
            config: config.control.clone(),
            curves: config.motors.iter().map(|m| LimitCurves::from(&m.limits)).collect(),
            safety: SafetyMonitor::new(thresholds, config.control.regen_threshold_amps),
            cruise: CruiseControl::new(&config.control),
            ramp: RampLimiter::new(config.control.ramp_up_erpm, config.control.ramp_down_erpm),
            throttles,
            watchdog,
            input_stale: false,
            lever_mismatch: false,
            brake: false,
        }
    }

    pub fn cruise_state(&self) -> CruiseState {
        self.cruise.state()
    }

    pub fn brake(&self) -> bool {
        self.brake
    }

    pub fn fault(&self) -> Option<&SafetyFault> {
        self.safety.fault()
    }

    fn sample(&mut self, input: Option<&InputFrame>) -> (Vec<ThrottleSample>, bool) {
        match input {
            // A frame that does not cover every lever cannot be trusted
            Some(frame) if frame.adc.len() != self.throttles.len() => {
                if !self.lever_mismatch {
                    warn!(
                        "Input carries {} throttle readings, expected {}; holding brake",
                        frame.adc.len(),
                        self.throttles.len()
                    );
                    self.lever_mismatch = true;
                }
                (Vec::new(), true)
            }
            Some(frame) => {
                if self.lever_mismatch {
                    warn!("Throttle readings complete again");
                    self.lever_mismatch = false;
                }
                if self.input_stale {
                    warn!("Rider input restored");
                    self.input_stale = false;
                }
                let samples = self
                    .throttles
                    .iter()
                    .zip(&frame.adc)
                    .map(|(t, &raw)| t.sample(raw))
                    .collect();
                (samples, frame.brake)
            }
            None => {
                if !self.input_stale {
                    warn!("Rider input lost, holding brake");
                    self.input_stale = true;
                }
                (Vec::new(), true)
            }
        }
    }

    /// Run one control tick. `input` is `None` when the rider input is
    /// stale. An `Err` is fatal: the motors have been zeroed and every
    /// later tick refuses to command anything.
    pub fn tick(
        &mut self,
        vehicle: &mut Vehicle,
        input: Option<&InputFrame>,
    ) -> Result<TickReport, SafetyFault> {
        if let Some(fault) = self.safety.fault() {
            return Err(fault.clone());
        }

        // 1. sample, highest lever wins
        let (samples, brake) = self.sample(input);
        self.brake = brake;

        // 2. range check
        if let Err(fault) = self.safety.check_throttle(&samples) {
            return Err(self.safety.trip(fault, &mut vehicle.motors));
        }
        let lever = samples.iter().map(|s| s.value).max().unwrap_or(0);

        // 3. cruise
        let enable = vehicle.remote.motor_enable;
        let throttle = self.cruise.update(&CruiseInput {
            throttle: lever,
            brake,
            buttons: vehicle.remote.buttons,
            wheel_speed_kmh: vehicle.primary_speed_kmh(),
            motor_enable: enable,
        });

        // 4. map, dead zone, ramp
        let dead_zone = self.config.dead_zone_erpm;
        let mut mapped = throttle_to_erpm(throttle, vehicle.primary_max_erpm());
        if mapped < dead_zone {
            mapped = 0;
        }
        let mut target = self.ramp.step(mapped);
        if target < dead_zone {
            target = 0;
        }

        // 5, 6. brake and enable override everything above
        if brake || !enable {
            target = 0;
            self.ramp.reset(0);
        }
        vehicle.targets.speed_erpm = target;

        // 7. command
        let mode = if !enable {
            DriveMode::Disabled
        } else if brake {
            DriveMode::Brake
        } else if target == 0 {
            DriveMode::Coast
        } else {
            DriveMode::Speed
        };
        let sent = match mode {
            DriveMode::Speed => command_all(&mut vehicle.motors, |m| m.set_motor_speed_rpm(target)),
            _ => command_all(&mut vehicle.motors, |m| m.set_motor_current_amps(0.0)),
        };

        // 8. only a tick that got through keeps us alive
        if sent {
            self.watchdog.feed();
        } else {
            debug!("Tick not fully delivered, watchdog not fed");
        }

        Ok(TickReport {
            mode,
            throttle,
            target_erpm: target,
            fed: sent,
        })
    }

    /// Recompute the speed dependent current limits from the primary
    /// wheel speed and push them to every channel
    pub fn refresh_limits(&mut self, vehicle: &mut Vehicle) {
        if self.safety.fault().is_some() {
            return;
        }
        let speed = vehicle.primary_speed_kmh();
        for (i, (motor, curves)) in vehicle.motors.iter_mut().zip(&self.curves).enumerate() {
            let limits = curves.at(speed);
            if i == 0 {
                vehicle.targets.motor_current_min = limits.motor_min;
                vehicle.targets.motor_current_max = limits.motor_max;
                vehicle.targets.battery_current_min = limits.battery_min;
                vehicle.targets.battery_current_max = limits.battery_max;
            }
            // Dropped frames are counted by the channel and resent next refresh
            if let Err(e) = motor.set_motor_current_limits(limits.motor_min, limits.motor_max) {
                debug!("{}: current limits dropped: {}", motor.name(), e);
            }
            if let Err(e) = motor.set_battery_current_limits(limits.battery_min, limits.battery_max)
            {
                debug!("{}: battery limits dropped: {}", motor.name(), e);
            }
        }
    }

    pub fn update_regen(&self, vehicle: &mut Vehicle) {
        vehicle.regen_active = self.safety.regen_active(&vehicle.motors);
    }
}

/// Apply `f` to every channel, even after a failure. True if all succeeded.
fn command_all<F>(motors: &mut [MotorChannel], mut f: F) -> bool
where
    F: FnMut(&mut MotorChannel) -> Result<(), TransportError>,
{
    let mut all_ok = true;
    for motor in motors.iter_mut() {
        all_ok &= f(motor).is_ok();
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MotorConfig, ThrottleConfig};
    use crate::vesc::sim::mock::RecordingLink;
    use crate::vesc::{Command, TelemetryDelta};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    /// Raw reading that normalizes to 500 with the default calibration
    const HALF: u16 = 505;

    struct CountingWatchdog(Rc<Cell<u32>>);

    impl Watchdog for CountingWatchdog {
        fn feed(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    struct Rig {
        control: ControlLoop,
        vehicle: Vehicle,
        links: Vec<RecordingLink>,
        feeds: Rc<Cell<u32>>,
    }

    impl Rig {
        fn new(motors: usize, levers: usize, control: ControlConfig) -> Self {
            let config = VehicleConfig {
                motors: vec![MotorConfig::default(); motors],
                throttles: vec![ThrottleConfig::default(); levers],
                control,
                can: None,
            };
            let feeds = Rc::new(Cell::new(0));
            let links: Vec<RecordingLink> = (0..motors).map(|_| RecordingLink::new()).collect();
            let channels = config
                .motors
                .iter()
                .zip(&links)
                .map(|(m, l)| MotorChannel::new(m.clone(), Box::new(l.clone())))
                .collect();
            let mut vehicle = Vehicle::new(channels);
            vehicle.on_receive(true, 0);
            Self {
                control: ControlLoop::new(&config, Box::new(CountingWatchdog(feeds.clone()))),
                vehicle,
                links,
                feeds,
            }
        }

        /// No ramping, so targets show up on the first tick
        fn instant() -> Self {
            Self::new(
                1,
                1,
                ControlConfig {
                    ramp_up_erpm: 100_000,
                    ramp_down_erpm: 100_000,
                    button_debounce_ticks: 0,
                    ..ControlConfig::default()
                },
            )
        }

        fn tick(&mut self, adc: &[u16], brake: bool) -> Result<TickReport, SafetyFault> {
            let frame = InputFrame {
                adc: adc.to_vec(),
                brake,
            };
            self.control.tick(&mut self.vehicle, Some(&frame))
        }

        fn last_command(&self, motor: usize) -> Option<Command> {
            self.links[motor].commands().last().copied()
        }
    }

    #[test]
    fn test_throttle_mapping() {
        assert_eq!(throttle_to_erpm(500, 13263), 6631);
        assert_eq!(throttle_to_erpm(0, 13263), 0);
        assert_eq!(throttle_to_erpm(1000, 13263), 13263);
        assert_eq!(throttle_to_erpm(5000, 13263), 13263);
    }

    #[test]
    fn test_missing_lever_reading_holds_brake() {
        let mut rig = Rig::new(1, 2, ControlConfig::default());
        let report = rig.tick(&[HALF], false).unwrap();
        assert_eq!(report.mode, DriveMode::Brake);
        assert_eq!(report.target_erpm, 0);
        assert!(rig.control.brake());
        assert_eq!(rig.last_command(0), Some(Command::SetCurrent(0)));

        // Both readings present again
        let report = rig.tick(&[HALF, 0], false).unwrap();
        assert!(!rig.control.brake());
        assert_ne!(report.mode, DriveMode::Brake);
    }

    #[test]
    fn test_dropped_limits_resent_next_refresh() {
        let mut rig = Rig::instant();
        *rig.links[0].fail_sends.borrow_mut() = true;
        rig.control.refresh_limits(&mut rig.vehicle);
        assert!(rig.links[0].commands().is_empty());
        assert_eq!(rig.vehicle.motors[0].stats().tx_dropped, 2);
        assert!(rig.vehicle.targets.motor_current_max > 0.0);

        *rig.links[0].fail_sends.borrow_mut() = false;
        rig.control.refresh_limits(&mut rig.vehicle);
        assert!(matches!(
            rig.links[0].commands()[..],
            [
                Command::SetCurrentLimits { .. },
                Command::SetBatteryCurrentLimits { .. }
            ]
        ));
    }

    #[test]
    fn test_half_throttle_commands_speed() {
        let mut rig = Rig::instant();
        let report = rig.tick(&[HALF], false).unwrap();
        assert_eq!(report.mode, DriveMode::Speed);
        assert_eq!(report.target_erpm, 6631);
        assert!(report.fed);
        assert_eq!(rig.vehicle.targets.speed_erpm, 6631);
        assert_eq!(rig.last_command(0), Some(Command::SetRpm(6631)));
        assert_eq!(rig.feeds.get(), 1);
    }

    #[test]
    fn test_ramp_limits_first_ticks() {
        let mut rig = Rig::new(1, 1, ControlConfig::default());
        let first = rig.tick(&[HALF], false).unwrap();
        assert_eq!(first.target_erpm, 250);
        let second = rig.tick(&[HALF], false).unwrap();
        assert_eq!(second.target_erpm, 500);
    }

    #[test]
    fn test_brake_overrides_throttle() {
        let mut rig = Rig::instant();
        rig.tick(&[830], false).unwrap();
        let report = rig.tick(&[830], true).unwrap();
        assert_eq!(report.mode, DriveMode::Brake);
        assert_eq!(report.target_erpm, 0);
        assert_eq!(rig.vehicle.targets.speed_erpm, 0);
        assert_eq!(rig.last_command(0), Some(Command::SetCurrent(0)));
    }

    #[test]
    fn test_disabled_sends_zero_current_only() {
        let mut rig = Rig::instant();
        rig.vehicle.on_receive(false, 0);
        let report = rig.tick(&[830], false).unwrap();
        assert_eq!(report.mode, DriveMode::Disabled);
        assert!(report.fed);
        assert_eq!(rig.links[0].commands(), vec![Command::SetCurrent(0)]);
    }

    #[test]
    fn test_dead_zone_coasts() {
        let mut rig = Rig::instant();
        // 185 raw -> 7/1000 -> 92 erpm, inside the dead zone
        let report = rig.tick(&[185], false).unwrap();
        assert_eq!(report.mode, DriveMode::Coast);
        assert_eq!(report.target_erpm, 0);
        assert_eq!(rig.last_command(0), Some(Command::SetCurrent(0)));
    }

    #[test]
    fn test_highest_lever_wins() {
        let mut rig = Rig::new(
            1,
            2,
            ControlConfig {
                ramp_up_erpm: 100_000,
                ..ControlConfig::default()
            },
        );
        let report = rig.tick(&[HALF, 180], false).unwrap();
        assert_eq!(report.throttle, 500);
        let report = rig.tick(&[180, 830], false).unwrap();
        assert_eq!(report.throttle, 1000);
    }

    #[test]
    fn test_over_range_trips_and_halts() {
        let mut rig = Rig::new(
            2,
            1,
            ControlConfig {
                ramp_up_erpm: 100_000,
                ..ControlConfig::default()
            },
        );
        let err = rig.tick(&[1023], false).unwrap_err();
        assert_eq!(
            err,
            SafetyFault::ThrottleOverRange {
                lever: 0,
                raw: 1023,
                threshold: 950
            }
        );
        for link in &rig.links {
            assert_eq!(link.commands(), vec![Command::SetCurrent(0); 3]);
        }
        assert_eq!(rig.feeds.get(), 0);

        // Halted: good input no longer produces commands
        assert!(rig.tick(&[HALF], false).is_err());
        assert_eq!(rig.links[0].commands().len(), 3);
        assert!(rig.control.fault().is_some());
    }

    #[test]
    fn test_failed_send_skips_watchdog() {
        let mut rig = Rig::instant();
        *rig.links[0].fail_sends.borrow_mut() = true;
        let report = rig.tick(&[HALF], false).unwrap();
        assert!(!report.fed);
        assert_eq!(rig.feeds.get(), 0);

        *rig.links[0].fail_sends.borrow_mut() = false;
        assert!(rig.tick(&[HALF], false).unwrap().fed);
        assert_eq!(rig.feeds.get(), 1);
    }

    #[test]
    fn test_stale_input_brakes() {
        let mut rig = Rig::instant();
        rig.tick(&[HALF], false).unwrap();
        let report = rig.control.tick(&mut rig.vehicle, None).unwrap();
        assert_eq!(report.mode, DriveMode::Brake);
        assert!(rig.control.brake());
        assert_eq!(rig.last_command(0), Some(Command::SetCurrent(0)));
    }

    #[test]
    fn test_cruise_holds_speed_after_release() {
        let mut rig = Rig::instant();
        rig.tick(&[HALF], false).unwrap(); // Idle -> WaitArm

        // Rolling at ~10 km/h
        rig.links[0].queue(TelemetryDelta {
            speed_erpm: Some(2400),
            ..Default::default()
        });
        rig.vehicle.ingest(Duration::from_millis(50));
        assert!(rig.vehicle.primary_speed_kmh() > 4.0);

        rig.vehicle.on_receive(true, 0x0001);
        let report = rig.tick(&[HALF], false).unwrap();
        assert_eq!(rig.control.cruise_state(), CruiseState::Active);
        assert_eq!(report.target_erpm, 6631);

        // Lever released, speed held
        let report = rig.tick(&[180], false).unwrap();
        assert_eq!(report.target_erpm, 6631);

        // Brake cancels
        let report = rig.tick(&[180], true).unwrap();
        assert_eq!(report.target_erpm, 0);
        assert_eq!(rig.control.cruise_state(), CruiseState::WaitArm);
    }

    #[test]
    fn test_refresh_limits_uses_primary_speed() {
        let mut rig = Rig::new(2, 1, ControlConfig::default());
        rig.control.refresh_limits(&mut rig.vehicle);
        let t = rig.vehicle.targets;
        assert_eq!(t.motor_current_max, 60.0);
        assert_eq!(t.motor_current_min, -30.0);
        assert_eq!(t.battery_current_max, 30.0);
        assert_eq!(t.battery_current_min, -10.0);
        for link in &rig.links {
            assert_eq!(
                link.commands(),
                vec![
                    Command::SetCurrentLimits { min: -30_000, max: 60_000 },
                    Command::SetBatteryCurrentLimits { min: -10_000, max: 30_000 },
                ]
            );
        }
    }

    #[test]
    fn test_regen_flag() {
        let mut rig = Rig::instant();
        rig.links[0].queue(TelemetryDelta {
            motor_current: Some(-500),
            ..Default::default()
        });
        rig.vehicle.ingest(Duration::from_millis(50));
        rig.control.update_regen(&mut rig.vehicle);
        assert!(rig.vehicle.regen_active);
    }
}
