// Link to the display and input boards over zenoh
//
// Inbound samples are drained without blocking at the start of a tick,
// latest wins. Outbound snapshots are JSON.

use serde::de::DeserializeOwned;
use tracing::{info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::sample::Sample;

use crate::config::{TOPIC_DISPLAY_CMD, TOPIC_HEALTH, TOPIC_INPUT, TOPIC_TELEMETRY};
use crate::error::RuntimeError;
use crate::messages::{InputFrame, RemoteCommand, RuntimeHealth, TelemetrySnapshot};
use crate::state::Vehicle;

pub struct DisplayLink {
    input: Subscriber<FifoChannelHandler<Sample>>,
    command: Subscriber<FifoChannelHandler<Sample>>,
    telemetry: Publisher<'static>,
    health: Publisher<'static>,
    _session: zenoh::Session,
}

impl DisplayLink {
    pub async fn open() -> Result<Self, RuntimeError> {
        info!("Opening Zenoh session...");
        let session = zenoh::open(zenoh::Config::default()).await?;

        info!("Setting up publishers and subscribers...");
        let input = session.declare_subscriber(TOPIC_INPUT).await?;
        let command = session.declare_subscriber(TOPIC_DISPLAY_CMD).await?;
        let telemetry = session.declare_publisher(TOPIC_TELEMETRY).await?;
        let health = session.declare_publisher(TOPIC_HEALTH).await?;

        info!("Subscribed to: {}, {}", TOPIC_INPUT, TOPIC_DISPLAY_CMD);
        info!("Publishing to: {}, {}", TOPIC_TELEMETRY, TOPIC_HEALTH);

        Ok(Self {
            input,
            command,
            telemetry,
            health,
            _session: session,
        })
    }

    /// Drain both inbound topics into the vehicle state. Returns the number
    /// of messages accepted.
    pub fn poll(&self, vehicle: &mut Vehicle) -> usize {
        let mut accepted = 0;
        while let Ok(Some(sample)) = self.input.try_recv() {
            if let Some(frame) = decode::<InputFrame>(&sample, "input frame") {
                vehicle.on_input(frame);
                accepted += 1;
            }
        }
        while let Ok(Some(sample)) = self.command.try_recv() {
            if let Some(cmd) = decode::<RemoteCommand>(&sample, "display command") {
                vehicle.on_receive(cmd.motor_enable, cmd.buttons);
                accepted += 1;
            }
        }
        accepted
    }

    pub async fn publish(
        &self,
        snapshot: &TelemetrySnapshot,
        health: RuntimeHealth,
    ) -> Result<(), RuntimeError> {
        self.telemetry.put(serde_json::to_string(snapshot)?).await?;
        self.health.put(serde_json::to_string(&health)?).await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(sample: &Sample, what: &str) -> Option<T> {
    parse(&sample.payload().to_bytes(), what)
}

fn parse<T: DeserializeOwned>(payload: &[u8], what: &str) -> Option<T> {
    match serde_json::from_slice::<T>(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to parse {}: {}", what, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse::<RemoteCommand>(b"{not json", "display command").is_none());
        assert!(parse::<InputFrame>(br#"{"adc": "x"}"#, "input frame").is_none());
    }

    #[test]
    fn test_parse_input_frame() {
        let frame = parse::<InputFrame>(br#"{"adc": [505], "brake": true}"#, "input frame");
        assert_eq!(
            frame,
            Some(InputFrame {
                adc: vec![505],
                brake: true
            })
        );
    }
}
