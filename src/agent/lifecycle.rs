//! Agent lifecycle management
//!
//! Wires the configuration into a [`Session`] and runs the startup sequence:
//! connect, subscribe to configuration (fatal on failure), optionally
//! subscribe to commands, then publish telemetry until done or shut down.

use super::telemetry::{PublishSummary, TelemetryPublisher};
use crate::config::AgentConfig;
use crate::credentials::{CredentialIssuer, CredentialProvider};
use crate::error::AgentResult;
use crate::protocol::ConfigurationSink;
use crate::session::subscription::spawn_config_drain;
use crate::session::{InboundQueue, ReconnectSupervisor, Session, SubscriptionManager};
use crate::transport::{SecureSessionBuilder, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cloneable handle that asks a running agent to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Telemetry agent with an injected transport
pub struct TelemetryAgent<T: Transport> {
    config: AgentConfig,
    session: Session<T>,
    supervisor: ReconnectSupervisor,
    subscriptions: SubscriptionManager,
    configuration: Arc<ConfigurationSink>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    drain_handle: Option<JoinHandle<()>>,
}

impl<T: Transport> TelemetryAgent<T> {
    /// Validate `config`, load the key and trust store, and build the session.
    /// Key and CA bytes are read by the caller.
    pub fn new(
        config: AgentConfig,
        private_key_pem: &[u8],
        ca_bundle: &[u8],
        transport: T,
    ) -> AgentResult<Self> {
        config.validate()?;
        let identity = config.identity()?;

        let issuer = CredentialIssuer::from_pem(&identity, private_key_pem)?
            .with_lifetime(config.token_lifetime());
        let credentials =
            CredentialProvider::new(issuer).with_refresh_margin(config.refresh_margin());

        let transport_config = SecureSessionBuilder::transport_config(
            ca_bundle,
            config.broker.tls_verification,
            config.broker.min_tls_version,
        )?;

        let session = Session::new(
            identity,
            credentials,
            transport_config,
            transport,
            config.session_options(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = ReconnectSupervisor::new(
            config.reconnect_policy(),
            config.retry_policy(),
            shutdown_rx.clone(),
        );
        let subscriptions =
            SubscriptionManager::new(config.retry_policy()).with_shutdown(shutdown_rx.clone());

        Ok(Self {
            config,
            session,
            supervisor,
            subscriptions,
            configuration: Arc::new(ConfigurationSink::new()),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            drain_handle: None,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Latest configuration pushed by the cloud
    pub fn configuration(&self) -> &Arc<ConfigurationSink> {
        &self.configuration
    }

    pub fn command_queue(&self) -> &Arc<InboundQueue> {
        self.session.command_queue()
    }

    /// Connect and attach subscriptions
    pub async fn start(&mut self) -> AgentResult<()> {
        info!(device = %self.session.identity(), "Starting telemetry agent");

        self.supervisor.connect(&mut self.session).await?;

        if let Err(e) = self.subscriptions.subscribe_config(&mut self.session).await {
            error!(error = %e, "Configuration subscription failed");
            return Err(e.into());
        }

        if self.config.subscriptions.commands {
            if let Err(e) = self.subscriptions.subscribe_commands(&mut self.session).await {
                warn!(error = %e, "Command subscription failed, continuing without commands");
            }
        }

        self.drain_handle = Some(spawn_config_drain(
            Arc::clone(self.session.config_queue()),
            Arc::clone(&self.configuration),
            self.shutdown_rx.clone(),
        ));
        Ok(())
    }

    /// Run the publish loop to completion or shutdown
    pub async fn run(&mut self) -> PublishSummary {
        let publisher =
            TelemetryPublisher::new(self.config.telemetry_settings(), self.shutdown_rx.clone());
        publisher
            .run(&mut self.session, Some(&mut self.supervisor))
            .await
    }

    /// Stop background work and close the session
    pub async fn shutdown(&mut self) -> AgentResult<()> {
        info!("Shutting down telemetry agent");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.drain_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Configuration drain task ended abnormally");
            }
        }

        self.session.disconnect().await?;
        info!(
            config = %self.configuration.current().config,
            reconnects = self.supervisor.reconnects(),
            "Telemetry agent stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::session::{SessionError, SessionState};
    use crate::testing::mocks::{MockTransport, TEST_CA_PEM, TEST_DEVICE_KEY_PEM};
    use std::time::Duration;

    fn fast_config() -> AgentConfig {
        let mut config = AgentConfig::test_config();
        config.telemetry.events = 2;
        config.telemetry.interval_ms = 1;
        config.telemetry.source = "sensor-A".to_string();
        config.subscriptions.retry_delay_secs = 0;
        config.reconnect.initial_delay_ms = 1;
        config
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let transport = MockTransport::new();
        let mut agent =
            TelemetryAgent::new(fast_config(), TEST_DEVICE_KEY_PEM, TEST_CA_PEM, transport.clone())
                .unwrap();

        agent.start().await.unwrap();
        assert_eq!(agent.session().state(), &SessionState::Connected);
        assert_eq!(transport.subscribe_attempts(), vec!["/devices/dev1/config"]);

        let mut updates = agent.configuration().watch();
        transport.inject("/devices/dev1/config", r#"{"Config":"interval=5"}"#);
        tokio::time::timeout(Duration::from_secs(1), updates.changed())
            .await
            .unwrap()
            .unwrap();

        let summary = agent.run().await;
        assert_eq!(summary.published, 2);

        agent.shutdown().await.unwrap();
        assert_eq!(agent.configuration().current().config, "interval=5");
        assert_eq!(agent.session().state(), &SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_config_subscription_failure_is_fatal() {
        let transport = MockTransport::new();
        transport.fail_all_subscribes();
        let mut agent =
            TelemetryAgent::new(fast_config(), TEST_DEVICE_KEY_PEM, TEST_CA_PEM, transport.clone())
                .unwrap();

        let err = agent.start().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Session(SessionError::Subscribe { attempts: 3, .. })
        ));
        assert_eq!(transport.subscribe_attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_command_subscription_failure_is_not_fatal() {
        let transport = MockTransport::new();
        let mut config = fast_config();
        config.subscriptions.commands = true;
        config.subscriptions.max_attempts = 1;
        let mut agent =
            TelemetryAgent::new(config, TEST_DEVICE_KEY_PEM, TEST_CA_PEM, transport.clone())
                .unwrap();

        transport.reject_filter("/devices/dev1/commands/#");
        agent.start().await.unwrap();
        assert_eq!(
            transport.subscribe_attempts(),
            vec!["/devices/dev1/config", "/devices/dev1/commands/#"]
        );
        assert_eq!(agent.session().subscribed_topics(), vec!["/devices/dev1/config"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = fast_config();
        config.device.project_id.clear();
        let result =
            TelemetryAgent::new(config, TEST_DEVICE_KEY_PEM, TEST_CA_PEM, MockTransport::new());
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_bad_key_rejected() {
        let result =
            TelemetryAgent::new(fast_config(), b"not a key", TEST_CA_PEM, MockTransport::new());
        assert!(matches!(result, Err(AgentError::Credential(_))));
    }

    #[test]
    fn test_strict_tls_needs_roots() {
        let result =
            TelemetryAgent::new(fast_config(), TEST_DEVICE_KEY_PEM, b"", MockTransport::new());
        assert!(matches!(result, Err(AgentError::Tls(_))));
    }

    #[tokio::test]
    async fn test_shutdown_handle_cancels_run() {
        let mut config = fast_config();
        config.telemetry.events = 0;
        config.telemetry.interval_ms = 5;
        let mut agent =
            TelemetryAgent::new(config, TEST_DEVICE_KEY_PEM, TEST_CA_PEM, MockTransport::new())
                .unwrap();
        agent.start().await.unwrap();

        let handle = agent.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.shutdown();
        });
        let summary = agent.run().await;
        assert!(summary.cancelled);
        agent.shutdown().await.unwrap();
    }
}
