//! Device session: the live, authenticated broker connection
//!
//! A [`Session`] owns the device identity, the credential provider, the
//! shared TLS configuration and the two inbound queues. It drives a
//! [`Transport`] through the `Disconnected -> Connecting -> Connected`
//! (or `Failed`) state machine and bounds every network wait with a timeout.
//!
//! Publish and subscribe failures are reported to the caller and never
//! change the connection state; reconnecting is the job of
//! [`supervisor::ReconnectSupervisor`].
//!
//! # Example
//!
//! ```rust
//! use telemetry_agent::protocol::{new_event, TopicBuilder};
//! use telemetry_agent::testing::{test_session, MockTransport};
//!
//! # tokio_test::block_on(async {
//! let transport = MockTransport::new();
//! let mut session = test_session(transport.clone());
//!
//! session.connect().await?;
//! session
//!     .publish(&TopicBuilder::events(session.device_id()), &new_event("sensor-A"))
//!     .await?;
//! session.disconnect().await?;
//!
//! assert_eq!(transport.published().len(), 1);
//! # Ok::<(), telemetry_agent::session::SessionError>(())
//! # }).unwrap();
//! ```

pub mod queue;
pub mod subscription;
pub mod supervisor;

pub use queue::{InboundQueue, OverflowPolicy, PushOutcome, DEFAULT_QUEUE_CAPACITY};
pub use subscription::{QueueHandler, RetryPolicy, SubscriptionManager};
pub use supervisor::{interruptible_sleep, ReconnectPolicy, ReconnectSupervisor};

use crate::credentials::{CredentialError, CredentialProvider};
use crate::identity::DeviceIdentity;
use crate::observability::metrics::metrics;
use crate::protocol::TelemetryEvent;
use crate::transport::security::BuildError;
use crate::transport::{
    BrokerEndpoint, MessageHandler, SecureSessionBuilder, TlsSetupError, Transport,
    TransportConfig,
};
use crate::{mqtt_span, session_span};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISCONNECT_LINGER: Duration = Duration::from_millis(250);

/// Connection state of a [`Session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("Credential expired at {expires_at}")]
    CredentialExpired { expires_at: DateTime<Utc> },
    #[error(transparent)]
    TlsSetup(#[from] TlsSetupError),
    #[error("Connection to broker failed")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Session is not connected (state: {0})")]
    NotConnected(SessionState),
    #[error("Publish to '{topic}' failed")]
    Publish {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Publish to '{topic}' was not confirmed within {timeout:?}")]
    PublishTimeout { topic: String, timeout: Duration },
    #[error("Subscribe to '{topic}' failed after {attempts} attempt(s)")]
    Subscribe {
        topic: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl From<BuildError> for SessionError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::CredentialExpired { expires_at } => {
                SessionError::CredentialExpired { expires_at }
            }
            BuildError::Tls(e) => SessionError::TlsSetup(e),
        }
    }
}

impl SessionError {
    /// Errors that another connect attempt cannot fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SessionError::Credential(_)
                | SessionError::CredentialExpired { .. }
                | SessionError::TlsSetup(_)
                | SessionError::Cancelled
        )
    }
}

/// Tunables for a [`Session`]
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub broker: BrokerEndpoint,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub disconnect_linger: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            broker: BrokerEndpoint::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            disconnect_linger: DEFAULT_DISCONNECT_LINGER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

type Subscription = (String, Arc<dyn MessageHandler>);

/// The live device session
pub struct Session<T: Transport> {
    identity: DeviceIdentity,
    credentials: CredentialProvider,
    transport_config: TransportConfig,
    transport: T,
    options: SessionOptions,
    state: SessionState,
    config_queue: Arc<InboundQueue>,
    command_queue: Arc<InboundQueue>,
    subscriptions: Vec<Subscription>,
}

impl<T: Transport> Session<T> {
    pub fn new(
        identity: DeviceIdentity,
        credentials: CredentialProvider,
        transport_config: TransportConfig,
        transport: T,
        options: SessionOptions,
    ) -> Self {
        let config_queue = Arc::new(InboundQueue::new(
            "config",
            options.queue_capacity,
            options.overflow_policy,
        ));
        let command_queue = Arc::new(InboundQueue::new(
            "commands",
            options.queue_capacity,
            options.overflow_policy,
        ));
        Self {
            identity,
            credentials,
            transport_config,
            transport,
            options,
            state: SessionState::Disconnected,
            config_queue,
            command_queue,
            subscriptions: Vec::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config_queue(&self) -> &Arc<InboundQueue> {
        &self.config_queue
    }

    pub fn command_queue(&self) -> &Arc<InboundQueue> {
        &self.command_queue
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Filters successfully subscribed on this session, in subscription order
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.iter().map(|(f, _)| f.clone()).collect()
    }

    pub(crate) fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.clone()
    }

    /// Connected according to both the state machine and the transport
    pub fn is_link_up(&self) -> bool {
        self.state == SessionState::Connected && self.transport.is_connected()
    }

    /// Reconcile the state machine with the transport after a silent link loss.
    /// Returns whether the link is up.
    pub fn sync_link_state(&mut self) -> bool {
        if self.state == SessionState::Connected && !self.transport.is_connected() {
            warn!(device_id = %self.identity.device_id(), "Broker link lost");
            metrics().mqtt_connection_closed();
            self.state = SessionState::Disconnected;
        }
        self.is_link_up()
    }

    /// Whether the token should be rotated at `now`
    pub fn credential_needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.credentials.needs_refresh(now)
    }

    /// Expiry of the token used for the current connection
    pub fn credential_expires_at(&self) -> Option<DateTime<Utc>> {
        self.credentials.current().map(|c| c.expires_at())
    }

    /// Open the broker connection with a freshly minted token.
    ///
    /// Blocks until the broker acknowledges, the transport fails, or the
    /// connect timeout elapses.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.is_link_up() {
            debug!("connect() on an open session, nothing to do");
            return Ok(());
        }
        let span = session_span!(
            device_id = %self.identity.device_id(),
            broker = %self.options.broker
        );
        self.connect_inner().instrument(span).await
    }

    async fn connect_inner(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Connecting;
        metrics().mqtt_connection_attempt();
        info!("Connecting to broker");

        let result = self.try_connect().await;
        match &result {
            Ok(()) => {
                self.state = SessionState::Connected;
                metrics().mqtt_connection_established();
                info!(
                    expires_at = ?self.credential_expires_at(),
                    "Session connected"
                );
            }
            Err(e) => {
                self.state = SessionState::Failed(e.to_string());
                metrics().mqtt_connection_failed();
                warn!(error = %e, "Session connect failed");
            }
        }
        result
    }

    async fn try_connect(&mut self) -> Result<(), SessionError> {
        let now = Utc::now();
        let credential = self.credentials.reissue_at(now)?;
        let params = SecureSessionBuilder::connect_params(
            &self.identity,
            &credential,
            &self.options.broker,
            self.options.keep_alive,
            now,
        )?;

        let connect_timeout = self.options.connect_timeout;
        let outcome = tokio::time::timeout(
            connect_timeout,
            self.transport.connect(&self.transport_config, &params),
        )
        .await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Connection(Box::new(e))),
            Err(_) => {
                // Tear down the half-open attempt before reporting
                if let Err(e) = self.transport.disconnect(Duration::ZERO).await {
                    debug!(error = %e, "Cleanup after connect timeout failed");
                }
                Err(SessionError::ConnectTimeout(connect_timeout))
            }
        }
    }

    /// Publish `event` fire-and-forget and wait for local send confirmation
    pub async fn publish(&self, topic: &str, event: &TelemetryEvent) -> Result<(), SessionError> {
        if !self.is_link_up() {
            metrics().publish_failed();
            return Err(SessionError::NotConnected(self.state.clone()));
        }

        let span = mqtt_span!(op = "publish", topic = %topic, event_id = %event.event_id);
        async {
            let payload = event.to_wire_bytes().map_err(|e| {
                metrics().publish_failed();
                warn!(error = %e, "Event cannot be encoded");
                SessionError::Publish {
                    topic: topic.to_string(),
                    source: Box::new(e),
                }
            })?;
            let bytes = payload.len();
            let timeout = self.options.publish_timeout;

            match tokio::time::timeout(timeout, self.transport.publish(topic, payload)).await {
                Ok(Ok(())) => {
                    metrics().event_published();
                    info!(bytes, "Event published");
                    Ok(())
                }
                Ok(Err(e)) => {
                    metrics().publish_failed();
                    warn!(error = %e, "Event publish failed");
                    Err(SessionError::Publish {
                        topic: topic.to_string(),
                        source: Box::new(e),
                    })
                }
                Err(_) => {
                    metrics().publish_timed_out();
                    warn!(?timeout, "Event publish not confirmed in time");
                    Err(SessionError::PublishTimeout {
                        topic: topic.to_string(),
                        timeout,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Single subscribe attempt; on success the subscription is recorded
    /// so it can be replayed after a reconnect
    pub async fn subscribe(
        &mut self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SessionError> {
        if !self.is_link_up() {
            return Err(SessionError::NotConnected(self.state.clone()));
        }

        metrics().subscribe_attempt();
        let span = mqtt_span!(op = "subscribe", topic = %topic);
        let result = self
            .transport
            .subscribe(topic, Arc::clone(&handler))
            .instrument(span)
            .await;

        match result {
            Ok(()) => {
                match self.subscriptions.iter_mut().find(|(f, _)| f == topic) {
                    Some(entry) => entry.1 = handler,
                    None => self.subscriptions.push((topic.to_string(), handler)),
                }
                Ok(())
            }
            Err(e) => {
                metrics().subscribe_failed();
                Err(SessionError::Subscribe {
                    topic: topic.to_string(),
                    attempts: 1,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Close the connection, lingering briefly for in-flight traffic.
    /// Calling this on a closed session is a no-op.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connected && !self.transport.is_connected() {
            self.state = SessionState::Disconnected;
            return Ok(());
        }

        let span = session_span!(device_id = %self.identity.device_id());
        let linger = self.options.disconnect_linger;
        let result = self.transport.disconnect(linger).instrument(span).await;
        self.state = SessionState::Disconnected;
        metrics().mqtt_connection_closed();

        match result {
            Ok(()) => {
                info!(device_id = %self.identity.device_id(), "Session disconnected");
                Ok(())
            }
            Err(e) => Err(SessionError::Connection(Box::new(e))),
        }
    }
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("subscriptions", &self.subscribed_topics())
            .finish_non_exhaustive()
    }
}
