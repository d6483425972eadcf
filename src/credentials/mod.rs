//! Device credentials
//!
//! Signed, time-bounded tokens that prove the device identity to the broker.
//!
//! - [`token`] - key loading, claim construction and RS256 signing
//! - [`provider`] - caches the current credential and reissues it before expiry

pub mod provider;
pub mod token;

pub use provider::CredentialProvider;
pub use token::{issue, Claims, Credential, CredentialError, CredentialIssuer, SigningKey};
