//! Credential provider
//!
//! Hands out a currently-valid credential, reissuing when the held one has
//! expired or is inside the refresh margin.

use super::token::{Credential, CredentialError, CredentialIssuer};
use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// Default safety margin before expiry: 10 minutes
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 10 * 60;

#[derive(Debug)]
pub struct CredentialProvider {
    issuer: CredentialIssuer,
    refresh_margin: Duration,
    current: Option<Credential>,
}

impl CredentialProvider {
    pub fn new(issuer: CredentialIssuer) -> Self {
        Self {
            issuer,
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            current: None,
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// Most recently issued credential, if any
    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    /// Return the held credential, reissuing if it is missing, expired or
    /// within the refresh margin at `now`
    pub fn credential_at(&mut self, now: DateTime<Utc>) -> Result<Credential, CredentialError> {
        if let Some(current) = &self.current {
            if !current.expires_within(now, self.refresh_margin) {
                return Ok(current.clone());
            }
            info!(
                expires_at = %current.expires_at(),
                "Device token expired or close to expiry, reissuing"
            );
        }
        self.reissue_at(now)
    }

    /// Unconditionally mint a new credential
    pub fn reissue_at(&mut self, now: DateTime<Utc>) -> Result<Credential, CredentialError> {
        let credential = self.issuer.issue(now)?;
        self.current = Some(credential.clone());
        Ok(credential)
    }

    /// True when the held credential should be rotated at `now`
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.current
            .as_ref()
            .map_or(true, |c| c.expires_within(now, self.refresh_margin))
    }
}
