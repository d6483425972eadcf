//! Device configuration pushed by the cloud
//!
//! The broker delivers configuration on `/devices/{id}/config` as a JSON
//! object with a single `Config` string. The sink keeps only the latest
//! value (last-write-wins) and ignores payloads it cannot parse.

use crate::observability::metrics::metrics;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Latest configuration pushed to this device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(rename = "Config")]
    pub config: String,
}

/// Reasons a configuration payload was ignored
#[derive(Debug, Error)]
pub enum ConfigParseError {
    #[error("empty configuration payload")]
    Empty,
    #[error("malformed configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeviceConfiguration {
    pub fn parse(payload: &[u8]) -> Result<Self, ConfigParseError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(ConfigParseError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Holds the latest [`DeviceConfiguration`] and notifies watchers on change
#[derive(Debug)]
pub struct ConfigurationSink {
    tx: watch::Sender<DeviceConfiguration>,
}

impl ConfigurationSink {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DeviceConfiguration::default());
        Self { tx }
    }

    /// Parse `payload` and replace the stored configuration.
    ///
    /// Parse failures are logged and leave the previous value in place.
    /// Returns whether the payload was applied.
    pub fn apply(&self, payload: &[u8]) -> bool {
        match DeviceConfiguration::parse(payload) {
            Ok(configuration) => {
                info!(bytes = payload.len(), "Applying configuration update");
                self.tx.send_replace(configuration);
                metrics().config_updated();
                true
            }
            Err(e) => {
                warn!(error = %e, "Ignoring configuration update");
                metrics().config_parse_failed();
                false
            }
        }
    }

    /// Snapshot of the current configuration
    pub fn current(&self) -> DeviceConfiguration {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every applied update
    pub fn watch(&self) -> watch::Receiver<DeviceConfiguration> {
        self.tx.subscribe()
    }
}

impl Default for ConfigurationSink {
    fn default() -> Self {
        Self::new()
    }
}
