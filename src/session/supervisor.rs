//! Reconnect supervisor
//!
//! Keeps a [`Session`] connected from the outside: retries connect with
//! exponential backoff, rotates the token by reconnecting before it expires,
//! and replays subscriptions after every new connection. All waits end early
//! when the shutdown signal fires.

use super::subscription::{RetryPolicy, SubscriptionManager};
use super::{Session, SessionError};
use crate::transport::Transport;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Connect attempts per outage (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Sum of all delays when attempts are bounded
    pub fn max_total_delay(&self) -> Option<Duration> {
        self.max_attempts.map(|max| {
            (1..max).map(|attempt| self.delay_for_attempt(attempt)).sum()
        })
    }
}

/// Perform interruptible sleep with shutdown monitoring.
/// Returns true if the sleep completed, false if shutdown was requested.
pub async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => match changed {
                Ok(()) if *shutdown_rx.borrow() => {
                    info!("Shutdown signal received during wait, stopping");
                    return false;
                }
                Ok(()) => {}
                Err(_) => {
                    // Sender gone: nobody can ask for shutdown any more
                    (&mut sleep).await;
                    return true;
                }
            },
        }
    }
}

pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    subscriptions: SubscriptionManager,
    shutdown: watch::Receiver<bool>,
    reconnects: u32,
}

impl ReconnectSupervisor {
    pub fn new(
        policy: ReconnectPolicy,
        subscribe_policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let subscriptions =
            SubscriptionManager::new(subscribe_policy).with_shutdown(shutdown.clone());
        Self {
            policy,
            subscriptions,
            shutdown,
            reconnects: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Number of successful reconnects after the initial connection
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Connect with exponential backoff. Permanent errors (bad key, expired
    /// credential, TLS setup) are returned at once.
    pub async fn connect<T: Transport>(
        &self,
        session: &mut Session<T>,
    ) -> Result<(), SessionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match session.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => e,
            };

            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(attempts = attempt, error = %error, "Reconnect attempts exhausted");
                return Err(error);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(attempt, retry_in = ?delay, error = %error, "Connect failed, backing off");
            if !interruptible_sleep(self.shutdown.clone(), delay).await {
                return Err(SessionError::Cancelled);
            }
        }
    }

    /// Make sure the session is usable: reconnect after link loss, rotate
    /// the token before expiry, and replay subscriptions on a new link.
    /// Returns whether a new connection was made.
    pub async fn ensure_connected<T: Transport>(
        &mut self,
        session: &mut Session<T>,
    ) -> Result<bool, SessionError> {
        let link_up = session.sync_link_state();
        let rotate = link_up && session.credential_needs_refresh(Utc::now());
        if link_up && !rotate {
            return Ok(false);
        }

        if rotate {
            info!(
                expires_at = ?session.credential_expires_at(),
                "Rotating device token by reconnecting"
            );
            if let Err(e) = session.disconnect().await {
                warn!(error = %e, "Disconnect before token rotation failed");
            }
        }

        self.connect(session).await?;
        self.reconnects += 1;
        self.subscriptions.resubscribe_all(session).await?;
        info!(reconnects = self.reconnects, "Session re-established");
        Ok(true)
    }
}
