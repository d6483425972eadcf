//! Transport layer for device-to-broker communication
//!
//! [`Transport`] abstracts the MQTT link so the session logic can be driven
//! by the rumqttc implementation in production and by a mock in tests.
//! Inbound messages are delivered to [`MessageHandler`]s from the
//! transport's own task, concurrently with the foreground caller.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub mod mqtt;
pub mod security;

pub use security::{
    BrokerEndpoint, BuildError, ConnectParams, SecureSessionBuilder, TlsSetupError, TlsVerification,
    TlsVersion, TransportConfig,
};

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Callback for inbound messages.
///
/// Runs on the transport's delivery task, so implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: InboundMessage);
}

/// Transport trait for the device session
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the encrypted link and wait for the broker's acknowledgement
    async fn connect(
        &mut self,
        tls: &TransportConfig,
        params: &ConnectParams,
    ) -> Result<(), Self::Error>;

    /// Close the link, waiting at most `linger` for in-flight traffic
    async fn disconnect(&mut self, linger: Duration) -> Result<(), Self::Error>;

    /// Send `payload` fire-and-forget and wait for local send confirmation
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// Subscribe to `filter` and route matching messages to `handler`;
    /// resolves once the broker acknowledges the subscription
    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Self::Error>;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttClient;
