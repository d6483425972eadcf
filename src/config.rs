//! Agent configuration
//!
//! Loaded once at startup from TOML, overridden by command-line flags and
//! then passed by reference to everything that needs it. Every section has
//! defaults, so an empty file (or no file at all) is a valid starting point.

use crate::agent::telemetry::{EventShape, TelemetrySettings};
use crate::credentials::token::MAX_TOKEN_LIFETIME_SECS;
use crate::identity::{DeviceIdentity, IdentityError};
use crate::session::{OverflowPolicy, ReconnectPolicy, RetryPolicy, SessionOptions};
use crate::transport::{BrokerEndpoint, TlsVerification, TlsVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Locations searched when no config file is given explicitly
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["telemetry-agent.toml", "config/telemetry-agent.toml"];

/// Main agent configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceSection,
    pub broker: BrokerSection,
    pub credentials: CredentialsSection,
    pub telemetry: TelemetrySection,
    pub subscriptions: SubscriptionsSection,
    pub queues: QueuesSection,
    pub reconnect: ReconnectSection,
}

/// Device identity fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSection {
    pub device_id: String,
    pub project_id: String,
    /// Registry id (short form)
    pub registry_id: String,
    pub region: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            project_id: String::new(),
            registry_id: String::new(),
            region: "europe-west1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    /// PEM bundle of trusted roots (https://pki.google.com/roots.pem)
    pub ca_path: PathBuf,
    pub tls_verification: TlsVerification,
    pub min_tls_version: TlsVersion,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub disconnect_linger_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let endpoint = BrokerEndpoint::default();
        Self {
            host: endpoint.host,
            port: endpoint.port,
            ca_path: PathBuf::from("root-ca.pem"),
            tls_verification: TlsVerification::Strict,
            min_tls_version: TlsVersion::Tls12,
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            publish_timeout_secs: 5,
            disconnect_linger_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialsSection {
    /// PEM-encoded RSA private key (PKCS#8 or PKCS#1)
    pub key_path: PathBuf,
    pub token_lifetime_secs: i64,
    /// Reissue the token this long before it expires
    pub refresh_margin_secs: i64,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("device.key.pem"),
            token_lifetime_secs: crate::credentials::token::DEFAULT_TOKEN_LIFETIME_SECS,
            refresh_margin_secs: crate::credentials::provider::DEFAULT_REFRESH_MARGIN_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySection {
    /// Number of events to send (0 = until shutdown)
    pub events: u64,
    /// Event source tag
    pub source: String,
    pub interval_ms: u64,
    pub shape: EventShape,
    /// Field map published when `shape = "fields"`
    pub fields: BTreeMap<String, String>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            events: 10,
            source: String::new(),
            interval_ms: 1000,
            shape: EventShape::Metric,
            fields: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubscriptionsSection {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// Also subscribe to `/devices/{id}/commands/#`
    pub commands: bool,
}

impl Default for SubscriptionsSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 5,
            commands: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueuesSection {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueuesSection {
    fn default() -> Self {
        Self {
            capacity: crate::session::DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Connect attempts per outage (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Values supplied on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub device_id: Option<String>,
    pub project_id: Option<String>,
    pub registry_id: Option<String>,
    pub region: Option<String>,
    pub events: Option<u64>,
    pub source: Option<String>,
    pub ca_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub interval_ms: Option<u64>,
    pub insecure: bool,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Missing required setting: {0}")]
    MissingField(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `explicit` if given (it must exist), else the first default
    /// location that exists, else built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        match DEFAULT_CONFIG_PATHS.iter().map(Path::new).find(|p| p.is_file()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Using default config file");
                Self::load_from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line values on top of the file values
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        set(&mut self.device.device_id, &overrides.device_id);
        set(&mut self.device.project_id, &overrides.project_id);
        set(&mut self.device.registry_id, &overrides.registry_id);
        set(&mut self.device.region, &overrides.region);
        set(&mut self.telemetry.events, &overrides.events);
        set(&mut self.telemetry.source, &overrides.source);
        set(&mut self.broker.ca_path, &overrides.ca_path);
        set(&mut self.credentials.key_path, &overrides.key_path);
        set(&mut self.telemetry.interval_ms, &overrides.interval_ms);
        if overrides.insecure {
            self.broker.tls_verification = TlsVerification::Permissive;
        }
    }

    /// Check the configuration is complete and sane
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("device.device_id", &self.device.device_id),
            ("device.project_id", &self.device.project_id),
            ("device.registry_id", &self.device.registry_id),
            ("device.region", &self.device.region),
            ("broker.host", &self.broker.host),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(name));
            }
        }

        if self.broker.port == 0 {
            return Err(ConfigError::InvalidConfig("broker.port cannot be 0".to_string()));
        }
        if self.broker.publish_timeout_secs == 0 || self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker timeouts must be at least 1 second".to_string(),
            ));
        }
        if !(1..=MAX_TOKEN_LIFETIME_SECS).contains(&self.credentials.token_lifetime_secs) {
            return Err(ConfigError::InvalidConfig(format!(
                "credentials.token_lifetime_secs must be between 1 and {MAX_TOKEN_LIFETIME_SECS}"
            )));
        }
        let lifetime = self.credentials.token_lifetime_secs;
        if !(0..lifetime).contains(&self.credentials.refresh_margin_secs) {
            return Err(ConfigError::InvalidConfig(
                "credentials.refresh_margin_secs must be between 0 and the token lifetime"
                    .to_string(),
            ));
        }
        if self.subscriptions.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "subscriptions.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.queues.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queues.capacity must be at least 1".to_string(),
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.telemetry.shape == EventShape::Fields && self.telemetry.fields.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "telemetry.shape = \"fields\" needs a [telemetry.fields] table".to_string(),
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> Result<DeviceIdentity, IdentityError> {
        DeviceIdentity::new(
            self.device.device_id.clone(),
            self.device.region.clone(),
            self.device.project_id.clone(),
            self.device.registry_id.clone(),
        )
    }

    pub fn broker_endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(self.broker.host.clone(), self.broker.port)
    }

    /// Token lifetime, clamped to the accepted range when `validate` was skipped
    pub fn token_lifetime(&self) -> chrono::Duration {
        let secs = self.credentials.token_lifetime_secs;
        chrono::Duration::seconds(secs.clamp(1, MAX_TOKEN_LIFETIME_SECS))
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        let secs = self.credentials.refresh_margin_secs;
        chrono::Duration::seconds(secs.clamp(0, MAX_TOKEN_LIFETIME_SECS))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            broker: self.broker_endpoint(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            publish_timeout: Duration::from_secs(self.broker.publish_timeout_secs),
            disconnect_linger: Duration::from_millis(self.broker.disconnect_linger_ms),
            queue_capacity: self.queues.capacity,
            overflow_policy: self.queues.overflow,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.subscriptions.max_attempts,
            retry_delay: Duration::from_secs(self.subscriptions.retry_delay_secs),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            multiplier: self.reconnect.multiplier,
            max_attempts: (self.reconnect.max_attempts > 0).then_some(self.reconnect.max_attempts),
        }
    }

    pub fn telemetry_settings(&self) -> TelemetrySettings {
        TelemetrySettings {
            events: self.telemetry.events,
            source: self.telemetry.source.clone(),
            interval: Duration::from_millis(self.telemetry.interval_ms),
            shape: self.telemetry.shape,
            fields: self.telemetry.fields.clone(),
        }
    }

    /// Effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
device_id = "dev1"
project_id = "proj1"
registry_id = "reg1"
region = "eu-west1"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
