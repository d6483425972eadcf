//! Pure connection state management for the MQTT client
//!
//! Link state, transport errors and translation of [`ConnectParams`] plus
//! [`TransportConfig`] into rumqttc options.

use crate::transport::security::{ConnectParams, TransportConfig};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::{MqttOptions, TlsConfiguration};
use thiserror::Error;

/// State of the underlying MQTT link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK received
    Connected,
    /// Link was up and went away (reason)
    Disconnected(String),
    /// Link never came up (reason)
    Failed(String),
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to '{filter}' rejected by broker: {reason}")]
    SubscriptionRejected { filter: String, reason: String },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: Option<LinkState> },
}

/// Pure function to build rumqttc options for one connection attempt
pub fn configure_mqtt_options(tls: &TransportConfig, params: &ConnectParams) -> MqttOptions {
    let mut options = MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);
    options.set_credentials(params.username.clone(), params.password().to_string());
    options.set_keep_alive(params.keep_alive);
    options.set_clean_session(params.clean_session);
    options.set_transport(RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(
        tls.client_config(),
    )));
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialIssuer;
    use crate::identity::DeviceIdentity;
    use crate::transport::security::{
        BrokerEndpoint, SecureSessionBuilder, TlsVerification, TlsVersion,
    };
    use chrono::Utc;
    use std::time::Duration;

    const KEY: &[u8] = include_bytes!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/device_key_pkcs8.pem"
    ));

    #[test]
    fn test_configure_mqtt_options() {
        let identity = DeviceIdentity::new("dev1", "eu-west1", "proj1", "reg1").unwrap();
        let credential = CredentialIssuer::from_pem(&identity, KEY)
            .unwrap()
            .issue(Utc::now())
            .unwrap();
        let tls = SecureSessionBuilder::transport_config(
            b"",
            TlsVerification::Permissive,
            TlsVersion::Tls12,
        )
        .unwrap();
        let params = SecureSessionBuilder::connect_params(
            &identity,
            &credential,
            &BrokerEndpoint::default(),
            Duration::from_secs(45),
            Utc::now(),
        )
        .unwrap();

        let options = configure_mqtt_options(&tls, &params);
        assert_eq!(options.client_id(), identity.client_id());
        assert_eq!(
            options.broker_address(),
            ("mqtt.googleapis.com".to_string(), 443)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert!(options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("unused".to_string(), credential.token().to_string()))
        );
    }

    #[test]
    fn test_link_state_equality() {
        assert_eq!(LinkState::Connected, LinkState::Connected);
        assert_ne!(
            LinkState::Connected,
            LinkState::Disconnected("gone".to_string())
        );
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("refused".to_string()),
            MqttError::PublishFailed("closed".into()),
            MqttError::SubscriptionFailed("closed".into()),
            MqttError::SubscriptionRejected {
                filter: "/devices/d/config".to_string(),
                reason: "failure".to_string(),
            },
            MqttError::NotConnected { state: None },
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
