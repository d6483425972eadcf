//! Device identity
//!
//! The four coordinates that name a device in the cloud registry. They derive
//! both the broker client identifier and the token audience, so they are
//! validated once and never mutated afterwards.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Identity validation errors
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("Device identity field '{0}' cannot be empty")]
    EmptyField(&'static str),
}

/// Immutable device identity: `{device_id, region, project_id, registry}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    device_id: String,
    region: String,
    project_id: String,
    registry: String,
}

impl DeviceIdentity {
    /// Build an identity, rejecting any empty (or whitespace-only) field
    pub fn new(
        device_id: impl Into<String>,
        region: impl Into<String>,
        project_id: impl Into<String>,
        registry: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            device_id: device_id.into(),
            region: region.into(),
            project_id: project_id.into(),
            registry: registry.into(),
        };

        for (name, value) in [
            ("device_id", &identity.device_id),
            ("region", &identity.region),
            ("project_id", &identity.project_id),
            ("registry", &identity.registry),
        ] {
            if value.trim().is_empty() {
                return Err(IdentityError::EmptyField(name));
            }
        }

        Ok(identity)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Broker client identifier:
    /// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry, self.device_id
        )
    }

    /// Audience claim for signed tokens
    pub fn audience(&self) -> &str {
        &self.project_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id())
    }
}
