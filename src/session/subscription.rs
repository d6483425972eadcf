//! Subscription Manager
//!
//! Runs the bounded-retry subscribe protocol and routes inbound messages
//! into the session's queues. Persistent failure is surfaced to the caller
//! after `max_attempts`; it is never retried forever.

use super::queue::InboundQueue;
use super::supervisor::interruptible_sleep;
use super::{Session, SessionError};
use crate::protocol::{ConfigurationSink, TopicBuilder};
use crate::transport::{InboundMessage, MessageHandler, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SUBSCRIBE_ATTEMPTS: u32 = 3;
pub const DEFAULT_SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Bounded retry policy for subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SUBSCRIBE_ATTEMPTS,
            retry_delay: DEFAULT_SUBSCRIBE_RETRY_DELAY,
        }
    }
}

/// Handler that appends every inbound message to a queue
#[derive(Debug, Clone)]
pub struct QueueHandler {
    queue: Arc<InboundQueue>,
}

impl QueueHandler {
    pub fn new(queue: Arc<InboundQueue>) -> Self {
        Self { queue }
    }
}

impl MessageHandler for QueueHandler {
    fn handle(&self, message: InboundMessage) {
        debug!(
            queue = self.queue.name(),
            topic = %message.topic,
            bytes = message.payload.len(),
            "Queueing inbound message"
        );
        self.queue.push(message);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    policy: RetryPolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SubscriptionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            shutdown: None,
        }
    }

    /// Abort retry waits when `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Attach `handler` to `topic`, retrying up to `max_attempts` times with
    /// `retry_delay` between attempts. Returns the last error once attempts
    /// are exhausted.
    pub async fn subscribe<T: Transport>(
        &self,
        session: &mut Session<T>,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SessionError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match session.subscribe(topic, Arc::clone(&handler)).await {
                Ok(()) => {
                    info!(topic = %topic, attempt, "Subscribed");
                    return Ok(());
                }
                Err(e) => as_subscribe_error(e, topic, attempt),
            };

            if attempt >= max_attempts {
                error!(
                    topic = %topic,
                    attempts = attempt,
                    error = %error,
                    "Giving up on subscription"
                );
                return Err(error);
            }

            warn!(
                topic = %topic,
                attempt,
                max_attempts,
                retry_in = ?self.policy.retry_delay,
                error = %error,
                "Subscribe failed, retrying"
            );
            if !self.wait(self.policy.retry_delay).await {
                return Err(SessionError::Cancelled);
            }
        }
    }

    /// Subscribe the configuration topic into the session's config queue
    pub async fn subscribe_config<T: Transport>(
        &self,
        session: &mut Session<T>,
    ) -> Result<(), SessionError> {
        let topic = TopicBuilder::config(session.device_id());
        let handler = Arc::new(QueueHandler::new(Arc::clone(session.config_queue())));
        self.subscribe(session, &topic, handler).await
    }

    /// Subscribe the command topic tree into the session's command queue
    pub async fn subscribe_commands<T: Transport>(
        &self,
        session: &mut Session<T>,
    ) -> Result<(), SessionError> {
        let topic = TopicBuilder::commands(session.device_id());
        let handler = Arc::new(QueueHandler::new(Arc::clone(session.command_queue())));
        self.subscribe(session, &topic, handler).await
    }

    /// Replay every recorded subscription, e.g. after a reconnect.
    /// Returns the first failure after trying all of them.
    pub async fn resubscribe_all<T: Transport>(
        &self,
        session: &mut Session<T>,
    ) -> Result<(), SessionError> {
        let mut first_error = None;
        for (topic, handler) in session.subscriptions() {
            if let Err(e) = self.subscribe(session, &topic, handler).await {
                if matches!(e, SessionError::Cancelled) {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn wait(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(shutdown) => interruptible_sleep(shutdown.clone(), delay).await,
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

fn as_subscribe_error(error: SessionError, topic: &str, attempts: u32) -> SessionError {
    match error {
        SessionError::Subscribe { topic, source, .. } => SessionError::Subscribe {
            topic,
            attempts,
            source,
        },
        other => SessionError::Subscribe {
            topic: topic.to_string(),
            attempts,
            source: Box::new(other),
        },
    }
}

/// Apply queued configuration pushes to `sink` until shutdown
pub fn spawn_config_drain(
    queue: Arc<InboundQueue>,
    sink: Arc<ConfigurationSink>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Configuration drain started");
        loop {
            tokio::select! {
                message = queue.pop() => {
                    sink.apply(&message.payload);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Apply whatever arrived before shutdown
        for message in queue.drain() {
            sink.apply(&message.payload);
        }
        debug!("Configuration drain stopped");
    })
}
