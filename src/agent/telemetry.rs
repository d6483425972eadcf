//! Telemetry publish loop
//!
//! Mints events on a fixed interval and publishes them on the device's
//! events topic. A failed publish is logged and counted; the loop moves on
//! to the next event. The loop ends after the configured number of events
//! or as soon as the shutdown signal fires.

use crate::protocol::{TelemetryEvent, TopicBuilder};
use crate::session::{interruptible_sleep, ReconnectSupervisor, Session, SessionError};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Which payload shape the loop publishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventShape {
    /// One pseudo-random `metric` per event
    #[default]
    Metric,
    /// The configured `Metrics` field map
    Fields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    /// Events to publish; 0 means until shutdown
    pub events: u64,
    pub source: String,
    pub interval: Duration,
    pub shape: EventShape,
    pub fields: BTreeMap<String, String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            events: 10,
            source: String::new(),
            interval: Duration::from_secs(1),
            shape: EventShape::Metric,
            fields: BTreeMap::new(),
        }
    }
}

/// Outcome counts of a publish run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub attempted: u64,
    pub published: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: bool,
}

pub struct TelemetryPublisher {
    settings: TelemetrySettings,
    shutdown: watch::Receiver<bool>,
}

impl TelemetryPublisher {
    pub fn new(settings: TelemetrySettings, shutdown: watch::Receiver<bool>) -> Self {
        Self { settings, shutdown }
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }

    pub fn next_event(&self) -> TelemetryEvent {
        match self.settings.shape {
            EventShape::Metric => TelemetryEvent::new(self.settings.source.clone()),
            EventShape::Fields => TelemetryEvent::with_fields(
                self.settings.source.clone(),
                self.settings.fields.clone(),
            ),
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Publish events until the count is reached or shutdown is requested.
    ///
    /// With a supervisor the loop reconnects (and rotates the token) between
    /// events; without one a lost link just makes each publish fail.
    pub async fn run<T: Transport>(
        &self,
        session: &mut Session<T>,
        mut supervisor: Option<&mut ReconnectSupervisor>,
    ) -> PublishSummary {
        let topic = TopicBuilder::events(session.device_id());
        let mut summary = PublishSummary::default();
        info!(
            topic = %topic,
            events = self.settings.events,
            interval = ?self.settings.interval,
            shape = ?self.settings.shape,
            "Starting telemetry publish loop"
        );

        loop {
            if self.settings.events != 0 && summary.attempted >= self.settings.events {
                break;
            }
            if self.shutdown_requested() {
                summary.cancelled = true;
                break;
            }
            summary.attempted += 1;

            let ready = match supervisor.as_deref_mut() {
                Some(supervisor) => match supervisor.ensure_connected(session).await {
                    Ok(_) => true,
                    Err(SessionError::Cancelled) => {
                        summary.cancelled = true;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Session unavailable, skipping event");
                        summary.failed += 1;
                        false
                    }
                },
                None => true,
            };

            if ready {
                let event = self.next_event();
                match session.publish(&topic, &event).await {
                    Ok(()) => summary.published += 1,
                    Err(SessionError::PublishTimeout { .. }) => summary.timed_out += 1,
                    Err(_) => summary.failed += 1,
                }
            }

            let more = self.settings.events == 0 || summary.attempted < self.settings.events;
            if more && !interruptible_sleep(self.shutdown.clone(), self.settings.interval).await {
                summary.cancelled = true;
                break;
            }
        }

        info!(
            attempted = summary.attempted,
            published = summary.published,
            failed = summary.failed,
            timed_out = summary.timed_out,
            cancelled = summary.cancelled,
            "Telemetry publish loop finished"
        );
        summary
    }
}
