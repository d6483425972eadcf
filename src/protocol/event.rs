//! Telemetry event wire model
//!
//! An event serialises to a flat JSON object:
//!
//! ```json
//! {"source_id":"sensor-A","event_id":"eid-<uuid>","event_ts":1700000000,"metric":0.42}
//! {"source_id":"sensor-A","event_id":"eid-<uuid>","event_ts":1700000000,"Metrics":{"pm10":"12"}}
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Prefix of every generated event id
pub const EVENT_ID_PREFIX: &str = "eid";

/// Events that cannot go on the wire
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// JSON has no NaN or infinity; serde_json would write `null`
    #[error("metric must be a finite number, got {0}")]
    NonFiniteMetric(f64),
    #[error("event encoding failed: {0}")]
    Encode(String),
}

/// Event payload: a single sampled metric or a caller-supplied field map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Scalar {
        metric: f64,
    },
    Fields {
        #[serde(rename = "Metrics")]
        metrics: BTreeMap<String, String>,
    },
}

impl EventPayload {
    /// Scalar payload, rejecting NaN and infinities
    pub fn scalar(metric: f64) -> Result<Self, EventError> {
        if metric.is_finite() {
            Ok(Self::Scalar { metric })
        } else {
            Err(EventError::NonFiniteMetric(metric))
        }
    }

    fn check(&self) -> Result<(), EventError> {
        match self {
            Self::Scalar { metric } if !metric.is_finite() => {
                Err(EventError::NonFiniteMetric(*metric))
            }
            _ => Ok(()),
        }
    }
}

/// A telemetry event, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub source_id: String,
    pub event_id: String,
    /// Unix seconds, UTC
    pub event_ts: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl TelemetryEvent {
    /// New event carrying a pseudo-random metric in `[0, 1)`
    pub fn new(source_id: impl Into<String>) -> Self {
        Self::with_payload(
            source_id,
            EventPayload::Scalar {
                metric: rand::random::<f64>(),
            },
        )
    }

    /// New event carrying a field map
    pub fn with_fields(source_id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self::with_payload(source_id, EventPayload::Fields { metrics: fields })
    }

    pub fn with_payload(source_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            source_id: source_id.into(),
            event_id: new_event_id(),
            event_ts: Utc::now().timestamp(),
            payload,
        }
    }

    /// Canonical JSON encoding with stable field order
    pub fn to_wire_string(&self) -> Result<String, EventError> {
        self.payload.check()?;
        serde_json::to_string(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, EventError> {
        self.to_wire_string().map(String::into_bytes)
    }
}

/// Convenience constructor matching the scalar event shape
pub fn new_event(source_id: impl Into<String>) -> TelemetryEvent {
    TelemetryEvent::new(source_id)
}

fn new_event_id() -> String {
    format!("{EVENT_ID_PREFIX}-{}", Uuid::new_v4())
}
