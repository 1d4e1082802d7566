// Fixed-period scheduler
//
// Four interval timers on one task: control 50 Hz, current limits 10 Hz,
// telemetry polling 20 Hz, display publish 5 Hz. Task bodies are
// synchronous; the only await per branch is the timer (and the network
// put when publishing), so `Vehicle` needs no locking.
//
// A safety fault halts the control task for good. Publishing continues so
// the display can show the fault until the watchdog resets the controller.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::config::{
    CONTROL_PERIOD, CanAdapter, INGEST_BUDGET, INGEST_PERIOD, INPUT_TIMEOUT, LIMITS_PERIOD,
    LinkConfig, PUBLISH_PERIOD, VehicleConfig, WATCHDOG_TIMEOUT,
};
use crate::control::ControlLoop;
use crate::display::DisplayLink;
use crate::error::{RuntimeError, TransportError};
use crate::messages::{RuntimeHealth, TelemetrySnapshot};
use crate::motor::{LinkStats, MotorChannel};
use crate::state::Vehicle;
use crate::vesc::{CanBus, CanLink, SimLink, SlcanBus, SocketBus, UartLink, VescLink};
use crate::watchdog::{DeviceWatchdog, ThreadWatchdog, Watchdog};

/// Startup options from the command line
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replace every hardware link with a simulated controller
    pub simulate: bool,
    /// Port override: the CAN interface or SLCAN adapter if a CAN bus is
    /// configured, otherwise the first motor's UART port
    pub port: Option<String>,
    /// Hardware watchdog device. Without one a supervisor thread is used.
    pub watchdog: Option<PathBuf>,
}

/// Opens motor links, sharing one CAN bus between all CAN nodes
struct LinkFactory<'a> {
    config: &'a VehicleConfig,
    simulate: bool,
    bus: Option<Rc<RefCell<dyn CanBus>>>,
}

impl LinkFactory<'_> {
    fn open(&mut self, link: &LinkConfig) -> Result<Box<dyn VescLink>, TransportError> {
        if self.simulate {
            return Ok(Box::new(SimLink::new()));
        }
        let link: Box<dyn VescLink> = match link {
            LinkConfig::Sim => Box::new(SimLink::new()),
            LinkConfig::Uart { port, baudrate } => {
                Box::new(UartLink::open_with_baudrate(port, *baudrate)?)
            }
            LinkConfig::Can { node_id } => Box::new(CanLink::new(self.bus()?, *node_id)),
        };
        Ok(link)
    }

    fn bus(&mut self) -> Result<Rc<RefCell<dyn CanBus>>, TransportError> {
        if let Some(bus) = &self.bus {
            return Ok(Rc::clone(bus));
        }
        let can = self.config.can.as_ref().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "CAN link without a configured adapter",
            ))
        })?;
        let bus: Rc<RefCell<dyn CanBus>> = match can.adapter {
            CanAdapter::Socket => Rc::new(RefCell::new(SocketBus::open(&can.port)?)),
            CanAdapter::Slcan => Rc::new(RefCell::new(SlcanBus::open(&can.port, can.bitrate)?)),
        };
        self.bus = Some(Rc::clone(&bus));
        Ok(bus)
    }
}

/// Open every configured motor channel, primary first
pub fn build_motors(
    config: &VehicleConfig,
    simulate: bool,
) -> Result<Vec<MotorChannel>, TransportError> {
    let mut links = LinkFactory {
        config,
        simulate,
        bus: None,
    };
    let mut motors = Vec::with_capacity(config.motors.len());
    for motor in &config.motors {
        let primary = links.open(&motor.link)?;
        let channel = match &motor.secondary {
            Some(secondary) => {
                let link = links.open(&secondary.link)?;
                MotorChannel::dual(motor.clone(), primary, link, secondary.factor)
            }
            None => MotorChannel::new(motor.clone(), primary),
        };
        info!(
            "Motor '{}' ready ({})",
            channel.name(),
            if channel.is_dual() { "dual" } else { "single" }
        );
        motors.push(channel);
    }
    Ok(motors)
}

/// Apply the `--port` override
pub fn override_port(config: &mut VehicleConfig, port: &str) {
    if let Some(can) = config.can.as_mut() {
        can.port = port.to_string();
        return;
    }
    if let Some(motor) = config.motors.first_mut() {
        if let LinkConfig::Uart { port: p, .. } = &mut motor.link {
            *p = port.to_string();
        }
    }
}

pub struct Runtime {
    vehicle: Vehicle,
    control: ControlLoop,
    health: RuntimeHealth,
    last_stats: LinkStats,
    halted: bool,
}

impl Runtime {
    pub fn new(vehicle: Vehicle, control: ControlLoop) -> Self {
        Self {
            vehicle,
            control,
            health: RuntimeHealth::InputStale, // Stale until the first input frame
            last_stats: LinkStats::default(),
            halted: false,
        }
    }

    pub fn vehicle(&self) -> &Vehicle {
        &self.vehicle
    }

    pub fn vehicle_mut(&mut self) -> &mut Vehicle {
        &mut self.vehicle
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// 50 Hz: pending telemetry first, then the control decision
    pub fn control_tick(&mut self) {
        if self.halted {
            return;
        }
        self.vehicle.drain_telemetry(INGEST_BUDGET);
        let input = self.vehicle.fresh_input(INPUT_TIMEOUT).cloned();
        if let Err(fault) = self.control.tick(&mut self.vehicle, input.as_ref()) {
            error!("Control halted: {}", fault);
            self.halted = true;
        }
    }

    /// 10 Hz: speed dependent current limits
    pub fn limits_tick(&mut self) {
        self.control.refresh_limits(&mut self.vehicle);
    }

    /// 20 Hz: drain telemetry, poll for more, update the regen flag
    pub fn ingest_tick(&mut self) {
        self.vehicle.ingest(INGEST_BUDGET);
        self.control.update_regen(&mut self.vehicle);
    }

    fn assess_health(&mut self) -> RuntimeHealth {
        let stats = self
            .vehicle
            .motors
            .iter()
            .fold(LinkStats::default(), |acc, m| acc + m.stats());
        let degraded = stats.tx_dropped > self.last_stats.tx_dropped
            || stats.rx_errors > self.last_stats.rx_errors
            || stats.rx_overrun > self.last_stats.rx_overrun;
        self.last_stats = stats;

        let health = if self.control.fault().is_some() {
            RuntimeHealth::SafetyFault
        } else if self.vehicle.fresh_input(INPUT_TIMEOUT).is_none() {
            RuntimeHealth::InputStale
        } else if degraded {
            RuntimeHealth::LinkDegraded
        } else {
            RuntimeHealth::Ok
        };

        if health != self.health {
            match health {
                RuntimeHealth::Ok => info!("Health: {:?}", health),
                _ => warn!("Health: {:?}", health),
            }
            self.health = health;
        }
        health
    }

    /// 5 Hz: snapshot for the display
    pub fn report(&mut self) -> (TelemetrySnapshot, RuntimeHealth) {
        let health = self.assess_health();
        let snapshot = self.vehicle.snapshot(
            self.control.cruise_state(),
            self.control.brake(),
            health,
        );
        (snapshot, health)
    }
}

fn open_watchdog(options: &RunOptions) -> Result<Box<dyn Watchdog>, RuntimeError> {
    open_watchdog_device(options).map_err(RuntimeError::Watchdog)
}

fn open_watchdog_device(options: &RunOptions) -> std::io::Result<Box<dyn Watchdog>> {
    let watchdog: Box<dyn Watchdog> = match &options.watchdog {
        Some(path) => Box::new(DeviceWatchdog::open(path)?),
        None => Box::new(ThreadWatchdog::spawn(WATCHDOG_TIMEOUT)?),
    };
    Ok(watchdog)
}

pub async fn run(mut config: VehicleConfig, options: RunOptions) -> Result<(), RuntimeError> {
    if let Some(port) = &options.port {
        override_port(&mut config, port);
    }
    config.validate()?;
    if options.simulate {
        info!("Simulation mode: no motor hardware will be opened");
    }

    let motors = build_motors(&config, options.simulate)?;
    let display = DisplayLink::open().await?;

    // Armed last: nothing before the loop feeds it
    let watchdog = open_watchdog(&options)?;
    let mut runtime = Runtime::new(Vehicle::new(motors), ControlLoop::new(&config, watchdog));

    let mut control = interval(CONTROL_PERIOD);
    let mut limits = interval(LIMITS_PERIOD);
    let mut ingest = interval(INGEST_PERIOD);
    let mut publish = interval(PUBLISH_PERIOD);
    for timer in [&mut control, &mut limits, &mut ingest, &mut publish] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    info!(
        "Runtime started: control {}ms, limits {}ms, telemetry {}ms, publish {}ms, {}ms input timeout",
        CONTROL_PERIOD.as_millis(),
        LIMITS_PERIOD.as_millis(),
        INGEST_PERIOD.as_millis(),
        PUBLISH_PERIOD.as_millis(),
        INPUT_TIMEOUT.as_millis()
    );

    loop {
        tokio::select! {
            _ = control.tick() => {
                display.poll(runtime.vehicle_mut());
                runtime.control_tick();
            }
            _ = limits.tick() => runtime.limits_tick(),
            _ = ingest.tick() => runtime.ingest_tick(),
            _ = publish.tick() => {
                let (snapshot, health) = runtime.report();
                display.publish(&snapshot, health).await?;
            }
        }
    }
}
