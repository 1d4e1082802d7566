// Message types exchanged with the display and input boards

use serde::{Deserialize, Serialize};

use crate::control::CruiseState;
use crate::motor::{ControlTargets, LinkStats, MotorTelemetry};

/// Raw rider input from the input board -> runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputFrame {
    /// One raw ADC reading per throttle lever
    pub adc: Vec<u16>,
    /// Debounced brake lever switch
    pub brake: bool,
}

/// Display -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub motor_enable: bool,
    #[serde(default)]
    pub buttons: u16,
}

/// Per-channel part of the telemetry snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MotorSnapshot {
    pub name: String,
    /// Primary first, then the secondary motor if any
    pub motors: Vec<MotorTelemetry>,
    pub link: LinkStats,
}

/// Runtime -> display, published periodically
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub wheel_speed_kmh: f32,
    pub channels: Vec<MotorSnapshot>,
    pub targets: ControlTargets,
    pub cruise: CruiseState,
    pub regen_active: bool,
    pub brake: bool,
    pub health: RuntimeHealth,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    InputStale,
    LinkDegraded,
    SafetyFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_defaults_buttons() {
        let cmd: RemoteCommand = serde_json::from_str(r#"{"motor_enable": true}"#).unwrap();
        assert_eq!(
            cmd,
            RemoteCommand {
                motor_enable: true,
                buttons: 0
            }
        );
    }

    #[test]
    fn test_input_frame_parse() {
        let frame: InputFrame =
            serde_json::from_str(r#"{"adc": [512, 190], "brake": false}"#).unwrap();
        assert_eq!(frame.adc, vec![512, 190]);
        assert!(!frame.brake);
    }

    #[test]
    fn test_health_serialization() {
        assert_eq!(
            serde_json::to_string(&RuntimeHealth::SafetyFault).unwrap(),
            "\"safety_fault\""
        );
    }
}
