//! Application side of the agent: startup sequence and the telemetry loop

pub mod lifecycle;
pub mod telemetry;

pub use lifecycle::{ShutdownHandle, TelemetryAgent};
pub use telemetry::{EventShape, PublishSummary, TelemetryPublisher, TelemetrySettings};
