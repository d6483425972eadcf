//! Top-level error type for the telemetry agent
//!
//! Each layer has its own `thiserror` enum; [`AgentError`] wraps them so the
//! binary can report any startup failure through one type. Messages that
//! might carry a bearer token go through [`sanitize_error_message`] before
//! they are logged.

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::identity::IdentityError;
use crate::session::SessionError;
use crate::transport::TlsSetupError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid device identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("TLS setup error: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to read {what} from {path}: {source}")]
    FileRead {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl AgentError {
    pub fn file_read(what: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            what,
            path: path.into(),
            source,
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Display text with the whole source chain, sanitized for logging
    pub fn to_log_string(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        sanitize_error_message(&message)
    }
}

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret regex")
});

/// Three base64url segments starting with `eyJ` (a serialized JWT)
static BEARER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("valid token regex")
});

static SENSITIVE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path regex")
});

/// Redact secrets from a message and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_ASSIGNMENT.replace_all(message, "${1}=***");
    let sanitized = BEARER_TOKEN.replace_all(&sanitized, "***JWT***");
    let mut sanitized = SENSITIVE_PATH
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    // Total length stays <= MAX_MESSAGE_LEN, cut on a char boundary
    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }
    sanitized
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
