//! Signed device tokens
//!
//! Tokens are compact JWTs signed with RSASSA-PKCS1-v1_5 / SHA-256 (RS256).
//! The claim set carries the project as audience plus the validity window
//! in unix seconds. Key bytes are handed in by the caller; nothing here
//! touches the filesystem.

use crate::identity::DeviceIdentity;
use crate::observability::metrics::metrics;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls::pki_types::PrivateKeyDer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default token validity: 24 hours
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Longest validity the broker accepts for a device token
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Fixed JOSE header for RS256 tokens
const JWT_HEADER: &str = r#"{"alg":"RS256","typ":"JWT"}"#;

/// Credential stage errors - both are fatal to startup
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to load private key: {0}")]
    KeyLoad(String),
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// RSA private key used to sign device tokens
pub struct SigningKey {
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl SigningKey {
    /// Parse a PEM-encoded RSA private key (PKCS#8 or PKCS#1)
    pub fn from_pem(pem: &[u8]) -> Result<Self, CredentialError> {
        let mut reader = pem;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| CredentialError::KeyLoad(format!("unreadable PEM input: {e}")))?
            .ok_or_else(|| CredentialError::KeyLoad("no private key found in PEM input".into()))?;

        let key_pair = match key {
            PrivateKeyDer::Pkcs8(der) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            PrivateKeyDer::Sec1(_) => {
                return Err(CredentialError::KeyLoad(
                    "RS256 requires an RSA key, found an EC (SEC1) key".into(),
                ))
            }
            _ => {
                return Err(CredentialError::KeyLoad(
                    "unsupported private key encoding".into(),
                ))
            }
        }
        .map_err(|e| CredentialError::KeyLoad(format!("key rejected: {e}")))?;

        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    /// DER-encoded `RSAPublicKey`, used to verify tokens minted by this key
    pub fn public_key_der(&self) -> &[u8] {
        self.key_pair.public().as_ref()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, message, &mut signature)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        Ok(signature)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("modulus_bits", &(self.key_pair.public().modulus_len() * 8))
            .finish_non_exhaustive()
    }
}

/// Token claim set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// A signed token together with its validity window
#[derive(Clone, PartialEq)]
pub struct Credential {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    token: String,
}

impl Credential {
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The encoded token, used as the broker password
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the credential is expired or will expire within `margin`
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now.checked_add_signed(margin)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token", &"***")
            .finish()
    }
}

/// Mints credentials for one device from one signing key
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    key: Arc<SigningKey>,
    audience: String,
    lifetime: Duration,
}

impl CredentialIssuer {
    pub fn new(identity: &DeviceIdentity, key: SigningKey) -> Self {
        Self {
            key: Arc::new(key),
            audience: identity.audience().to_string(),
            lifetime: Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
        }
    }

    pub fn from_pem(
        identity: &DeviceIdentity,
        private_key_pem: &[u8],
    ) -> Result<Self, CredentialError> {
        Ok(Self::new(identity, SigningKey::from_pem(private_key_pem)?))
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Build the claim set for `now`, sign it and return the credential
    pub fn issue(&self, now: DateTime<Utc>) -> Result<Credential, CredentialError> {
        let expires_at = now.checked_add_signed(self.lifetime).ok_or_else(|| {
            CredentialError::Signing(format!(
                "token lifetime of {}s overflows the expiry timestamp",
                self.lifetime.num_seconds()
            ))
        })?;
        let claims = Claims {
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let claims_json =
            serde_json::to_vec(&claims).map_err(|e| CredentialError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = self.key.sign(signing_input.as_bytes())?;
        let token = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature));

        metrics().credential_issued();
        debug!(
            audience = %claims.aud,
            expires_at = %expires_at,
            "Issued device token"
        );

        Ok(Credential {
            issued_at: now,
            expires_at,
            token,
        })
    }
}

/// One-shot issuance: parse `private_key_pem` and sign a credential for `identity`
pub fn issue(
    identity: &DeviceIdentity,
    private_key_pem: &[u8],
    now: DateTime<Utc>,
) -> Result<Credential, CredentialError> {
    CredentialIssuer::from_pem(identity, private_key_pem)?.issue(now)
}
