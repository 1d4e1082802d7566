// Motor channels for the drive
//
// Provides:
// - ERPM to wheel speed conversion
// - Telemetry, targets and link counters
// - MotorChannel: high-level command API with dual-motor fan-out

mod channel;
pub mod kinematics;
pub mod telemetry;

pub use channel::MotorChannel;
pub use kinematics::erpm_to_kmh;
pub use telemetry::{ControlTargets, LinkStats, MotorTelemetry};
