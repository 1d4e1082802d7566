// High-level motor channel
//
// Combines a motor's static configuration, its live telemetry and the
// links to one or two physical controllers. With a secondary motor every
// command fans out to both; currents and limits are scaled by each
// drive's factor, speed targets are not.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::telemetry::{LinkStats, MotorTelemetry};
use crate::config::MotorConfig;
use crate::error::{LinkError, TransportError};
use crate::vesc::{Command, VescLink, fault_name};

/// One physical controller behind a channel
struct Drive {
    link: Box<dyn VescLink>,
    factor: f32,
    telemetry: MotorTelemetry,
    stats: LinkStats,
    failing: bool,
}

impl Drive {
    fn new(link: Box<dyn VescLink>, factor: f32) -> Self {
        Self {
            link,
            factor,
            telemetry: MotorTelemetry::default(),
            stats: LinkStats::default(),
            failing: false,
        }
    }
}

pub struct MotorChannel {
    config: MotorConfig,
    drives: Vec<Drive>, // [primary, secondary?]
}

impl MotorChannel {
    /// Single motor channel
    pub fn new(config: MotorConfig, link: Box<dyn VescLink>) -> Self {
        let drives = vec![Drive::new(link, config.factor)];
        Self { config, drives }
    }

    /// Channel fanning out to a second physical motor
    pub fn dual(
        config: MotorConfig,
        primary: Box<dyn VescLink>,
        secondary: Box<dyn VescLink>,
        secondary_factor: f32,
    ) -> Self {
        let drives = vec![
            Drive::new(primary, config.factor),
            Drive::new(secondary, secondary_factor),
        ];
        Self { config, drives }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub fn is_dual(&self) -> bool {
        self.drives.len() > 1
    }

    /// Send to every drive, scaled by its factor. A failed send is counted
    /// and dropped; the first failure is returned so the caller knows the
    /// tick did not get through.
    fn command(&mut self, command: Command) -> Result<(), TransportError> {
        self.dispatch(command, |_| true)
    }

    /// `command` restricted to the drives whose link passes `wanted`
    fn dispatch(
        &mut self,
        command: Command,
        wanted: impl Fn(&dyn VescLink) -> bool,
    ) -> Result<(), TransportError> {
        let mut first_err = None;
        for (i, drive) in self.drives.iter_mut().enumerate() {
            if !wanted(drive.link.as_ref()) {
                continue;
            }
            let scaled = command.scaled(drive.factor);
            match drive.link.send(&scaled) {
                Ok(()) => {
                    drive.stats.tx_ok += 1;
                    if drive.failing {
                        info!("{}[{}]: link recovered", self.config.name, i);
                        drive.failing = false;
                    }
                }
                Err(e) => {
                    drive.stats.tx_dropped += 1;
                    if !drive.failing {
                        warn!("{}[{}]: dropping {:?}: {}", self.config.name, i, scaled, e);
                        drive.failing = true;
                    } else {
                        debug!("{}[{}]: dropping {:?}: {}", self.config.name, i, scaled, e);
                    }
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current mode. Positive drives, negative regenerates.
    pub fn set_motor_current_amps(&mut self, amps: f32) -> Result<(), TransportError> {
        self.command(Command::set_current(amps))
    }

    /// Braking current, always applied as a magnitude
    pub fn set_motor_current_brake_amps(&mut self, amps: f32) -> Result<(), TransportError> {
        self.command(Command::set_current_brake(amps.abs()))
    }

    /// Closed-loop speed mode, clamped to the configured maximum
    pub fn set_motor_speed_rpm(&mut self, erpm: i32) -> Result<(), TransportError> {
        let max = self.config.max_erpm;
        self.command(Command::set_rpm(erpm.clamp(-max, max)))
    }

    pub fn set_motor_current_limits(&mut self, min: f32, max: f32) -> Result<(), TransportError> {
        self.command(Command::set_current_limits(min.min(max), max))
    }

    pub fn set_battery_current_limits(&mut self, min: f32, max: f32) -> Result<(), TransportError> {
        self.command(Command::set_battery_current_limits(min.min(max), max))
    }

    /// Keep-alive to every drive, plus a status poll to the drives whose
    /// controllers do not broadcast status on their own
    pub fn request_status(&mut self) -> Result<(), TransportError> {
        let heartbeat = self.command(Command::Heartbeat);
        let poll = self.dispatch(Command::GetValues, |link| link.polls_status());
        heartbeat.and(poll)
    }

    /// Drain pending status frames until nothing is left or `budget` runs
    /// out. Each drive gets an equal share of the budget. Returns the
    /// number of frames applied.
    pub fn update_motor_data(&mut self, budget: Duration) -> usize {
        let share = budget / self.drives.len() as u32;
        let mut applied = 0;
        let (pole_pairs, radius) = (self.config.pole_pairs, self.config.wheel_radius_m);

        for (i, drive) in self.drives.iter_mut().enumerate() {
            let start = Instant::now();
            loop {
                if start.elapsed() >= share {
                    debug!("{}[{}]: telemetry budget spent", self.config.name, i);
                    break;
                }
                match drive.link.recv() {
                    Ok(Some(delta)) => {
                        if let Some(code) = delta.fault.filter(|&c| c != drive.telemetry.fault) {
                            warn!(
                                "{}[{}]: controller fault {}",
                                self.config.name,
                                i,
                                fault_name(code)
                            );
                        }
                        drive.telemetry.apply(&delta, pole_pairs, radius);
                        drive.stats.rx_frames += 1;
                        applied += 1;
                    }
                    Ok(None) => break,
                    Err(LinkError::Protocol(e)) => {
                        drive.stats.rx_rejected += 1;
                        debug!("{}[{}]: frame discarded: {}", self.config.name, i, e);
                    }
                    Err(LinkError::Transport(e)) => {
                        drive.stats.rx_errors += 1;
                        debug!("{}[{}]: receive failed: {}", self.config.name, i, e);
                        break;
                    }
                }
            }
        }
        applied
    }

    /// Telemetry of the primary motor
    pub fn telemetry(&self) -> &MotorTelemetry {
        &self.drives[0].telemetry
    }

    /// Telemetry of every physical motor, primary first
    pub fn all_telemetry(&self) -> impl Iterator<Item = &MotorTelemetry> {
        self.drives.iter().map(|d| &d.telemetry)
    }

    pub fn wheel_speed_kmh(&self) -> f32 {
        self.telemetry().wheel_speed_kmh
    }

    pub fn stats(&self) -> LinkStats {
        self.drives.iter().fold(LinkStats::default(), |acc, d| {
            acc + LinkStats {
                rx_overrun: d.link.rx_overruns(),
                ..d.stats
            }
        })
    }
}

impl Drop for MotorChannel {
    fn drop(&mut self) {
        // Leave the motors coasting
        if let Err(e) = self.set_motor_current_amps(0.0) {
            warn!("{}: failed to zero current on drop: {}", self.config.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vesc::sim::mock::RecordingLink;
    use crate::vesc::TelemetryDelta;

    const BUDGET: Duration = Duration::from_millis(100);

    fn single() -> (MotorChannel, RecordingLink) {
        let link = RecordingLink::new();
        let channel = MotorChannel::new(MotorConfig::default(), Box::new(link.clone()));
        (channel, link)
    }

    #[test]
    fn test_current_command() {
        let (mut channel, link) = single();
        channel.set_motor_current_amps(10.0).unwrap();
        assert_eq!(link.commands(), vec![Command::SetCurrent(10_000)]);
    }

    #[test]
    fn test_brake_current_is_magnitude() {
        let (mut channel, link) = single();
        channel.set_motor_current_brake_amps(-8.0).unwrap();
        assert_eq!(link.commands(), vec![Command::SetCurrentBrake(8_000)]);
    }

    #[test]
    fn test_speed_clamped_to_max() {
        let (mut channel, link) = single();
        channel.set_motor_speed_rpm(50_000).unwrap();
        assert_eq!(link.commands(), vec![Command::SetRpm(13263)]);
    }

    #[test]
    fn test_limits_keep_min_below_max() {
        let (mut channel, link) = single();
        channel.set_motor_current_limits(5.0, 2.0).unwrap();
        assert_eq!(
            link.commands(),
            vec![Command::SetCurrentLimits { min: 2_000, max: 2_000 }]
        );
    }

    #[test]
    fn test_dual_fan_out_scaled() {
        let rear = RecordingLink::new();
        let front = RecordingLink::new();
        let mut channel = MotorChannel::dual(
            MotorConfig::default(),
            Box::new(rear.clone()),
            Box::new(front.clone()),
            0.5,
        );
        assert!(channel.is_dual());
        channel.set_motor_current_amps(20.0).unwrap();
        channel.set_battery_current_limits(-4.0, 10.0).unwrap();

        assert_eq!(
            rear.commands(),
            vec![
                Command::SetCurrent(20_000),
                Command::SetBatteryCurrentLimits { min: -4_000, max: 10_000 }
            ]
        );
        assert_eq!(
            front.commands(),
            vec![
                Command::SetCurrent(10_000),
                Command::SetBatteryCurrentLimits { min: -2_000, max: 5_000 }
            ]
        );
    }

    #[test]
    fn test_failed_send_counted() {
        let (mut channel, link) = single();
        *link.fail_sends.borrow_mut() = true;
        assert!(channel.set_motor_current_amps(1.0).is_err());
        *link.fail_sends.borrow_mut() = false;
        channel.set_motor_current_amps(1.0).unwrap();
        let stats = channel.stats();
        assert_eq!(stats.tx_dropped, 1);
        assert_eq!(stats.tx_ok, 1);
    }

    #[test]
    fn test_update_applies_deltas() {
        let (mut channel, link) = single();
        link.queue(TelemetryDelta {
            speed_erpm: Some(4000),
            ..Default::default()
        });
        link.queue(TelemetryDelta {
            battery_voltage: Some(5100),
            ..Default::default()
        });
        assert_eq!(channel.update_motor_data(BUDGET), 2);
        assert_eq!(channel.telemetry().speed_erpm, 4000);
        assert_eq!(channel.telemetry().battery_voltage, 5100);
        assert!(channel.wheel_speed_kmh() > 0.0);
    }

    #[test]
    fn test_corrupt_frame_keeps_last_good_value() {
        let (mut channel, link) = single();
        link.queue(TelemetryDelta {
            motor_current: Some(800),
            ..Default::default()
        });
        channel.update_motor_data(BUDGET);

        link.queue_corrupt();
        assert_eq!(channel.update_motor_data(BUDGET), 0);
        assert_eq!(channel.telemetry().motor_current, 800);
        assert_eq!(channel.stats().rx_rejected, 1);
    }

    #[test]
    fn test_zero_budget_reads_nothing() {
        let (mut channel, link) = single();
        link.queue(TelemetryDelta::default());
        assert_eq!(channel.update_motor_data(Duration::ZERO), 0);
    }

    #[test]
    fn test_request_status_sends_poll_and_heartbeat() {
        let (mut channel, link) = single();
        channel.request_status().unwrap();
        assert_eq!(link.commands(), vec![Command::Heartbeat, Command::GetValues]);
    }

    #[test]
    fn test_failed_heartbeat_still_polls() {
        let (mut channel, link) = single();
        link.refuse.borrow_mut().push(Command::Heartbeat);
        assert!(channel.request_status().is_err());
        assert_eq!(link.commands(), vec![Command::GetValues]);
        let stats = channel.stats();
        assert_eq!(stats.tx_dropped, 1);
        assert_eq!(stats.tx_ok, 1);
    }

    #[test]
    fn test_broadcasting_link_is_not_polled() {
        let link = RecordingLink {
            broadcasts: true,
            ..RecordingLink::new()
        };
        let mut channel = MotorChannel::new(MotorConfig::default(), Box::new(link.clone()));
        channel.request_status().unwrap();
        assert_eq!(link.commands(), vec![Command::Heartbeat]);
        assert_eq!(channel.stats().tx_ok, 1);
    }

    #[test]
    fn test_dual_speed_is_not_scaled() {
        let rear = RecordingLink::new();
        let front = RecordingLink::new();
        let mut channel = MotorChannel::dual(
            MotorConfig::default(),
            Box::new(rear.clone()),
            Box::new(front.clone()),
            0.6,
        );
        channel.set_motor_speed_rpm(6631).unwrap();
        channel.set_motor_current_limits(-10.0, 50.0).unwrap();

        assert_eq!(
            rear.commands(),
            vec![
                Command::SetRpm(6631),
                Command::SetCurrentLimits { min: -10_000, max: 50_000 }
            ]
        );
        assert_eq!(
            front.commands(),
            vec![
                Command::SetRpm(6631),
                Command::SetCurrentLimits { min: -6_000, max: 30_000 }
            ]
        );
    }

    #[test]
    fn test_busy_primary_does_not_starve_secondary() {
        let rear = RecordingLink::new();
        let front = RecordingLink::new();
        let mut channel = MotorChannel::dual(
            MotorConfig::default(),
            Box::new(rear.clone()),
            Box::new(front.clone()),
            1.0,
        );
        for erpm in 0..200_000 {
            rear.queue(TelemetryDelta {
                speed_erpm: Some(erpm),
                ..Default::default()
            });
        }
        front.queue(TelemetryDelta {
            motor_current: Some(-5000),
            ..Default::default()
        });

        channel.update_motor_data(Duration::from_millis(2));
        assert_eq!(channel.all_telemetry().nth(1).map(|t| t.motor_current), Some(-5000));
    }

    #[test]
    fn test_bus_overruns_in_stats() {
        let (channel, link) = single();
        *link.overruns.borrow_mut() = 3;
        assert_eq!(channel.stats().rx_overrun, 3);
    }

    #[test]
    fn test_drop_zeroes_current() {
        let (channel, link) = single();
        drop(channel);
        assert_eq!(link.commands(), vec![Command::SetCurrent(0)]);
    }
}
