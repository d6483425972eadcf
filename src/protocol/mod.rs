//! Wire-level protocol: telemetry events, configuration pushes and topics

pub mod configuration;
pub mod event;
pub mod topics;

pub use configuration::{ConfigParseError, ConfigurationSink, DeviceConfiguration};
pub use event::{new_event, EventError, EventPayload, TelemetryEvent, EVENT_ID_PREFIX};
pub use topics::{topic_matches, TopicBuilder};
