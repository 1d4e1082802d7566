// Simulated VESC for bench runs without hardware (--simulate)
//
// Speed follows RPM commands with a fixed slew, coasts down under zero
// current, and a status report is produced after every command burst.

use super::{Command, TelemetryDelta, VescLink};
use crate::error::{LinkError, TransportError};

/// ERPM change per status report
const SLEW_ERPM: i32 = 400;
/// Coast-down factor per report under zero current, in percent
const COAST_PERCENT: i32 = 97;
/// Pack voltage reported, centi-volts
const PACK_VOLTAGE: i32 = 5040;

#[derive(Debug, Default)]
pub struct SimLink {
    speed_erpm: i32,
    target_erpm: Option<i32>,
    current_ma: i32,
    max_current_ma: i32,
    report_pending: bool,
    commands: u64,
}

impl SimLink {
    pub fn new() -> Self {
        Self {
            max_current_ma: i32::MAX,
            ..Default::default()
        }
    }

    /// Commands accepted so far
    pub fn commands(&self) -> u64 {
        self.commands
    }

    fn step(&mut self) {
        match self.target_erpm {
            Some(target) => {
                let delta = (target - self.speed_erpm).clamp(-SLEW_ERPM, SLEW_ERPM);
                self.speed_erpm += delta;
            }
            None => {
                self.speed_erpm = self.speed_erpm * COAST_PERCENT / 100;
            }
        }
    }

    fn motor_current_centi(&self) -> i32 {
        match self.target_erpm {
            // Loosely proportional to how far the speed loop still has to go
            Some(target) => {
                let limit = self.max_current_ma / 10;
                ((target - self.speed_erpm) / 10).clamp(-limit, limit)
            }
            None => self.current_ma / 10,
        }
    }
}

impl VescLink for SimLink {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        self.commands += 1;
        match *command {
            Command::SetRpm(erpm) => self.target_erpm = Some(erpm),
            Command::SetCurrent(ma) | Command::SetCurrentBrake(ma) => {
                self.target_erpm = None;
                self.current_ma = ma;
            }
            Command::SetCurrentLimits { max, .. } => self.max_current_ma = max.max(0),
            Command::GetValues | Command::Heartbeat => self.report_pending = true,
            Command::SetBatteryCurrentLimits { .. } => {}
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<TelemetryDelta>, LinkError> {
        if !self.report_pending {
            return Ok(None);
        }
        self.report_pending = false;
        self.step();

        let motor_current = self.motor_current_centi();
        Ok(Some(TelemetryDelta {
            speed_erpm: Some(self.speed_erpm),
            motor_current: Some(motor_current),
            battery_current: Some(motor_current / 2),
            controller_temp: Some(300),
            motor_temp: Some(350),
            battery_voltage: Some(PACK_VOLTAGE),
            state_of_charge: Some(80),
            fault: Some(0),
        }))
    }
}

#[cfg(test)]
pub mod mock {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::super::{Command, TelemetryDelta, VescLink};
    use crate::error::{LinkError, ProtocolError, TransportError};

    /// What a test wants `recv` to produce next
    pub enum Incoming {
        Delta(TelemetryDelta),
        Corrupt,
    }

    /// Link double shared with the test through `Rc` handles
    #[derive(Clone, Default)]
    pub struct RecordingLink {
        pub sent: Rc<RefCell<Vec<Command>>>,
        pub incoming: Rc<RefCell<VecDeque<Incoming>>>,
        pub fail_sends: Rc<RefCell<bool>>,
        /// Commands refused with `Busy`
        pub refuse: Rc<RefCell<Vec<Command>>>,
        pub overruns: Rc<RefCell<u64>>,
        /// Behaves like a CAN node that reports status unasked
        pub broadcasts: bool,
    }

    impl RecordingLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn commands(&self) -> Vec<Command> {
            self.sent.borrow().clone()
        }

        pub fn queue(&self, delta: TelemetryDelta) {
            self.incoming.borrow_mut().push_back(Incoming::Delta(delta));
        }

        pub fn queue_corrupt(&self) {
            self.incoming.borrow_mut().push_back(Incoming::Corrupt);
        }
    }

    impl VescLink for RecordingLink {
        fn send(&mut self, command: &Command) -> Result<(), TransportError> {
            if *self.fail_sends.borrow() || self.refuse.borrow().contains(command) {
                return Err(TransportError::Busy);
            }
            self.sent.borrow_mut().push(*command);
            Ok(())
        }

        fn recv(&mut self) -> Result<Option<TelemetryDelta>, LinkError> {
            match self.incoming.borrow_mut().pop_front() {
                None => Ok(None),
                Some(Incoming::Delta(d)) => Ok(Some(d)),
                Some(Incoming::Corrupt) => Err(ProtocolError::ChecksumMismatch {
                    computed: 0x1234,
                    received: 0x4321,
                }
                .into()),
            }
        }

        fn polls_status(&self) -> bool {
            !self.broadcasts
        }

        fn rx_overruns(&self) -> u64 {
            *self.overruns.borrow()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_follows_rpm() {
        let mut sim = SimLink::new();
        sim.send(&Command::SetRpm(1000)).unwrap();
        sim.send(&Command::GetValues).unwrap();
        let delta = sim.recv().unwrap().unwrap();
        assert_eq!(delta.speed_erpm, Some(SLEW_ERPM));
        assert_eq!(sim.recv().unwrap(), None);

        for _ in 0..5 {
            sim.send(&Command::Heartbeat).unwrap();
            sim.recv().unwrap();
        }
        sim.send(&Command::GetValues).unwrap();
        assert_eq!(sim.recv().unwrap().unwrap().speed_erpm, Some(1000));
    }

    #[test]
    fn test_sim_coasts_on_zero_current() {
        let mut sim = SimLink::new();
        sim.send(&Command::SetRpm(400)).unwrap();
        sim.send(&Command::GetValues).unwrap();
        sim.recv().unwrap();
        sim.send(&Command::set_current(0.0)).unwrap();
        sim.send(&Command::GetValues).unwrap();
        let speed = sim.recv().unwrap().unwrap().speed_erpm.unwrap();
        assert!(speed < 400 && speed > 0);
        assert_eq!(sim.commands(), 4);
    }
}
