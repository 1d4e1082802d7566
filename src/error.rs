// Error types shared by the codec, the motor links and the control loop

/// Failure to put bytes on (or take bytes off) a motor controller transport.
///
/// Never propagated past a motor channel: the command is dropped, counted,
/// and the next scheduled tick sends it again.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bus busy, frame dropped")]
    Busy,

    #[error("Write timed out")]
    Timeout,
}

/// A frame that failed verification. The frame is discarded and telemetry
/// keeps its last good value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    ChecksumMismatch { computed: u16, received: u16 },

    #[error("Invalid frame delimiter 0x{0:02X}")]
    BadDelimiter(u8),

    #[error("Unexpected packet id {0}")]
    UnexpectedPacket(u8),

    #[error("Payload of {0} bytes does not fit a frame")]
    Oversize(usize),

    #[error("Malformed SLCAN line: {0}")]
    MalformedLine(String),
}

/// Any failure a link can report while receiving.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Non-recoverable condition detected by the safety monitor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SafetyFault {
    #[error("Throttle {lever} ADC over range: raw {raw} > threshold {threshold}")]
    ThrottleOverRange { lever: usize, raw: u16, threshold: u16 },
}

/// Static configuration rejected at startup, before any motor command.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Motor {motor}: {field} min {min} exceeds max {max}")]
    MinExceedsMax {
        motor: String,
        field: &'static str,
        min: f32,
        max: f32,
    },

    #[error("Motor {motor}: {reason}")]
    InvalidMotor { motor: String, reason: String },

    #[error("Invalid vehicle setting: {0}")]
    Invalid(String),
}

/// Top level error returned by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open motor link: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to arm watchdog: {0}")]
    Watchdog(#[source] std::io::Error),

    #[error(transparent)]
    Safety(#[from] SafetyFault),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zenoh error: {0}")]
    Zenoh(String),
}

impl From<zenoh::Error> for RuntimeError {
    fn from(e: zenoh::Error) -> Self {
        RuntimeError::Zenoh(e.to_string())
    }
}
