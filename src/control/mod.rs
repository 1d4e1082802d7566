mod cruise;
mod drive;
mod limits;
mod ramp;
mod safety;
mod throttle;

pub use cruise::{CruiseControl, CruiseInput, CruiseState};
pub use drive::{ControlLoop, DriveMode, TickReport, throttle_to_erpm};
pub use limits::{CurrentLimitCurve, LimitCurves, MotorLimits};
pub use ramp::RampLimiter;
pub use safety::{SafetyMonitor, emergency_stop};
pub use throttle::{THROTTLE_MAX, Throttle, ThrottleSample};
