//! Impure I/O operations for the MQTT client
//!
//! Owns the rumqttc event loop task and coordinates it with callers through
//! a watch channel for link state and per-request confirmation tickets.
//! The loop stops on the first network error; reconnection is the session
//! supervisor's job.

use super::connection::{configure_mqtt_options, LinkState, MqttError};
use super::message_handler::{EventRoute, EventRouter, RouteTable};
use super::pending::PendingRequests;
use crate::observability::metrics::metrics;
use crate::transport::security::{ConnectParams, TransportConfig};
use crate::transport::{InboundMessage, MessageHandler, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_REQUEST_CAPACITY: usize = 10;
const DEFAULT_SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// rumqttc-backed [`Transport`]
pub struct MqttClient {
    client: Option<AsyncClient>,
    routes: Arc<RouteTable>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<LinkState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    sent: Arc<PendingRequests<()>>,
    subacks: Arc<PendingRequests<Result<(), String>>>,
    enqueue: Mutex<()>,
    request_capacity: usize,
    suback_timeout: Duration,
}

/// Channels the event loop task reports through
struct EventLoopContext {
    client_id: String,
    state_tx: watch::Sender<LinkState>,
    shutdown_rx: watch::Receiver<bool>,
    sent: Arc<PendingRequests<()>>,
    subacks: Arc<PendingRequests<Result<(), String>>>,
    routes: Arc<RouteTable>,
}

impl MqttClient {
    pub fn new() -> Self {
        Self {
            client: None,
            routes: Arc::new(RouteTable::new()),
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
            sent: Arc::new(PendingRequests::new()),
            subacks: Arc::new(PendingRequests::new()),
            enqueue: Mutex::new(()),
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            suback_timeout: DEFAULT_SUBACK_TIMEOUT,
        }
    }

    /// How long to wait for the broker's SUBACK
    pub fn with_suback_timeout(mut self, timeout: Duration) -> Self {
        self.suback_timeout = timeout;
        self
    }

    /// Current link state, `None` before the first connect
    pub fn link_state(&self) -> Option<LinkState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn check_connected(&self) -> Result<&AsyncClient, MqttError> {
        let state = self.link_state();
        match (&self.client, &state) {
            (Some(client), Some(LinkState::Connected)) => Ok(client),
            _ => Err(MqttError::NotConnected { state }),
        }
    }

    /// Wait for ConnAck or the first terminal state
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
    ) -> Result<(), MqttError> {
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                LinkState::Connected => return Ok(()),
                LinkState::Failed(reason) | LinkState::Disconnected(reason) => {
                    return Err(MqttError::ConnectionFailed(reason));
                }
                LinkState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailed(
                    "Event loop stopped before ConnAck".to_string(),
                ));
            }
        }
    }

    /// Stop the event loop task, giving it `linger` to finish on its own
    async fn stop_event_loop(&mut self, linger: Duration) {
        if let Some(mut handle) = self.event_loop_handle.take() {
            if tokio::time::timeout(linger, &mut handle).await.is_err() {
                if let Some(shutdown_tx) = &self.shutdown_tx {
                    let _ = shutdown_tx.send(true);
                }
                handle.abort();
                debug!("MQTT event loop aborted after linger");
            }
        }
        self.sent.close();
        self.subacks.close();
        self.shutdown_tx = None;
        self.state_rx = None;
        self.client = None;
    }

    async fn run_event_loop(mut event_loop: EventLoop, ctx: EventLoopContext) {
        let EventLoopContext {
            client_id,
            state_tx,
            mut shutdown_rx,
            sent,
            subacks,
            routes,
        } = ctx;
        let mut connected = false;
        let mut closing = false;

        info!(client_id = %client_id, "Starting MQTT event loop");
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            match EventRouter::route_mqtt_event(&event) {
                                EventRoute::ConnectionAcknowledged => {
                                    connected = true;
                                    let _ = state_tx.send(LinkState::Connected);
                                }
                                EventRoute::MessageReceived { topic, payload } => {
                                    metrics().message_received();
                                    routes.dispatch(InboundMessage::new(topic, payload));
                                }
                                EventRoute::SubscriptionAcknowledged { packet_id, result } => {
                                    debug!(packet_id, ok = result.is_ok(), "SubAck received");
                                    subacks.confirm(result);
                                }
                                EventRoute::PublishSent(_) => sent.confirm(()),
                                EventRoute::DisconnectSent => {
                                    closing = true;
                                    let _ = state_tx.send(LinkState::Disconnected(
                                        "client disconnect".to_string(),
                                    ));
                                }
                                EventRoute::Disconnected => {
                                    warn!("Broker closed the MQTT session");
                                    let _ = state_tx.send(LinkState::Disconnected(
                                        "broker disconnect".to_string(),
                                    ));
                                    break;
                                }
                                EventRoute::InfrastructureEvent(event_str) => {
                                    debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                                }
                                EventRoute::OutgoingEvent => {}
                            }
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            if closing {
                                debug!(error = %reason, "Event loop closed after disconnect");
                            } else if connected {
                                error!(error = %reason, "MQTT link lost");
                                let _ = state_tx.send(LinkState::Disconnected(reason));
                            } else {
                                error!(error = %reason, "MQTT connection failed");
                                let _ = state_tx.send(LinkState::Failed(reason));
                            }
                            break;
                        }
                    }
                }
            }
        }
        sent.close();
        subacks.close();
        info!(client_id = %client_id, "MQTT event loop stopped");
    }
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(
        &mut self,
        tls: &TransportConfig,
        params: &ConnectParams,
    ) -> Result<(), Self::Error> {
        if self.event_loop_handle.is_some() {
            self.stop_event_loop(Duration::ZERO).await;
        }

        let options = configure_mqtt_options(tls, params);
        let (client, event_loop) = AsyncClient::new(options, self.request_capacity);

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Fresh ledgers per link; the stopped loop closed the previous ones
        self.sent = Arc::new(PendingRequests::new());
        self.subacks = Arc::new(PendingRequests::new());

        let ctx = EventLoopContext {
            client_id: params.client_id.clone(),
            state_tx,
            shutdown_rx,
            sent: Arc::clone(&self.sent),
            subacks: Arc::clone(&self.subacks),
            routes: Arc::clone(&self.routes),
        };
        self.event_loop_handle = Some(tokio::spawn(Self::run_event_loop(event_loop, ctx)));
        self.client = Some(client);
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        if let Err(e) = Self::wait_for_connection_confirmation(state_rx).await {
            self.stop_event_loop(Duration::ZERO).await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self, linger: Duration) -> Result<(), Self::Error> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        match tokio::time::timeout(linger, client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Disconnect request not delivered"),
            Err(_) => debug!("Disconnect request timed out"),
        }
        self.stop_event_loop(linger).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        let client = self.check_connected()?;

        let ticket = {
            // Tickets must be issued in queue order
            let _enqueue = self.enqueue.lock().await;
            client
                .publish(topic, QoS::AtMostOnce, false, payload)
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
            self.sent.issue()
        };

        match ticket.wait().await {
            Some(()) => Ok(()),
            None => Err(MqttError::PublishFailed(
                "link closed before the message was sent".into(),
            )),
        }
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Self::Error> {
        let client = self.check_connected()?;

        // Route first so messages arriving right after the SubAck are not lost
        self.routes.add(filter, handler);

        let outcome = async {
            let ticket = {
                let _enqueue = self.enqueue.lock().await;
                client
                    .subscribe(filter, QoS::AtMostOnce)
                    .await
                    .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
                self.subacks.issue()
            };

            // A timed-out ticket keeps its slot so its late SubAck is discarded
            match tokio::time::timeout(self.suback_timeout, ticket.wait()).await {
                Ok(Some(Ok(()))) => Ok(()),
                Ok(Some(Err(reason))) => Err(MqttError::SubscriptionRejected {
                    filter: filter.to_string(),
                    reason,
                }),
                Ok(None) => Err(MqttError::SubscriptionFailed(
                    "link closed before SubAck".into(),
                )),
                Err(_) => Err(MqttError::SubscriptionFailed(
                    format!("no SubAck within {:?}", self.suback_timeout).into(),
                )),
            }
        }
        .await;

        if outcome.is_err() {
            self.routes.remove(filter);
        }
        outcome
    }

    fn is_connected(&self) -> bool {
        matches!(self.link_state(), Some(LinkState::Connected))
    }
}
