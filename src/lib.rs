//! Telemetry Agent - secure MQTT telemetry for constrained devices
//!
//! A device authenticates to the cloud broker with short-lived RS256 tokens,
//! keeps a TLS-protected MQTT session open, publishes telemetry events and
//! consumes configuration pushes.
//!
//! # Overview
//!
//! - [`credentials`] - signed, time-bounded device tokens and their rotation
//! - [`transport`] - TLS setup, the [`transport::Transport`] abstraction and the rumqttc client
//! - [`session`] - connection state machine, bounded subscribe retry, reconnect supervision
//! - [`protocol`] - event wire format, topic scheme and the configuration sink
//! - [`agent`] - startup sequence and the cancellable publish loop
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_agent::protocol::{new_event, TopicBuilder};
//!
//! let event = new_event("sensor-A");
//! let json = event.to_wire_string().unwrap();
//! assert!(json.contains(r#""source_id":"sensor-A""#));
//! assert_eq!(TopicBuilder::events("dev1"), "/devices/dev1/events");
//! ```

pub mod agent;
pub mod config;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod observability;
pub mod protocol;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use agent::{TelemetryAgent, TelemetryPublisher};
pub use config::{AgentConfig, ConfigError, ConfigOverrides};
pub use credentials::{Credential, CredentialError, CredentialIssuer, CredentialProvider};
pub use error::{AgentError, AgentResult};
pub use identity::{DeviceIdentity, IdentityError};
pub use protocol::{new_event, ConfigurationSink, DeviceConfiguration, TelemetryEvent};
pub use session::{Session, SessionError, SessionState, SubscriptionManager};
pub use transport::mqtt::MqttClient;
pub use transport::{SecureSessionBuilder, Transport, TransportConfig};
