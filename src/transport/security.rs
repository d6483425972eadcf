//! Secure session building
//!
//! Turns a CA bundle into a shared rustls client configuration and binds a
//! device credential into broker connection parameters. Nothing here opens
//! a socket.
//!
//! # Verification policy
//!
//! [`TlsVerification::Strict`] requires at least one trusted root from the CA
//! bundle and verifies the broker certificate against it.
//! [`TlsVerification::Permissive`] accepts any broker certificate (handshake
//! signatures are still checked) and logs a warning every time a
//! configuration is built with it.

use crate::credentials::Credential;
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_BROKER_HOST: &str = "mqtt.googleapis.com";
pub const DEFAULT_BROKER_PORT: u16 = 443;

/// The broker ignores the username; authentication rides on the token
pub const BROKER_USERNAME: &str = "unused";

/// ALPN protocol id the broker expects on port 443
const MQTT_ALPN: &[u8] = b"mqtt";

/// Certificate verification policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerification {
    #[default]
    Strict,
    Permissive,
}

/// Minimum TLS protocol version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    fn allowed_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12_AND_UP: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            TlsVersion::Tls12 => TLS12_AND_UP,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

/// TLS setup errors
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("CA bundle contains no usable certificates; strict verification needs a trusted root")]
    NoTrustedRoots,
    #[error("Failed to build TLS client configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Errors binding a credential into connection parameters
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Credential expired at {expires_at}")]
    CredentialExpired { expires_at: DateTime<Utc> },
    #[error(transparent)]
    Tls(#[from] TlsSetupError),
}

/// Immutable TLS settings shared by every connection attempt
#[derive(Clone)]
pub struct TransportConfig {
    client_config: Arc<ClientConfig>,
    trusted_roots: usize,
    min_protocol_version: TlsVersion,
    skip_verify: bool,
}

impl TransportConfig {
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client_config)
    }

    /// Number of trust anchors loaded from the CA bundle
    pub fn trusted_roots(&self) -> usize {
        self.trusted_roots
    }

    pub fn min_protocol_version(&self) -> TlsVersion {
        self.min_protocol_version
    }

    /// True when broker certificates are not verified
    pub fn skip_verify(&self) -> bool {
        self.skip_verify
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("trusted_roots", &self.trusted_roots)
            .field("min_protocol_version", &self.min_protocol_version)
            .field("skip_verify", &self.skip_verify)
            .finish()
    }
}

/// Broker host/port pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssl://{}:{}", self.host, self.port)
    }
}

/// Parameters for one MQTT CONNECT
#[derive(Clone, PartialEq)]
pub struct ConnectParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    password: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credential_expires_at: DateTime<Utc>,
}

impl ConnectParams {
    /// The signed token presented as the MQTT password
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("credential_expires_at", &self.credential_expires_at)
            .finish()
    }
}

/// Assembles transport security and connection parameters
pub struct SecureSessionBuilder;

impl SecureSessionBuilder {
    /// Build the shared TLS configuration from already-read CA bundle bytes
    pub fn transport_config(
        ca_bundle: &[u8],
        verification: TlsVerification,
        min_version: TlsVersion,
    ) -> Result<TransportConfig, TlsSetupError> {
        let roots = load_trusted_roots(ca_bundle);
        let trusted_roots = roots.len();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(min_version.allowed_versions())?;

        let mut client_config = match verification {
            TlsVerification::Strict => {
                if roots.is_empty() {
                    return Err(TlsSetupError::NoTrustedRoots);
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            TlsVerification::Permissive => {
                warn!(
                    trusted_roots,
                    "TLS certificate verification is DISABLED (permissive mode): \
                     the broker identity is not authenticated"
                );
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider)))
                    .with_no_client_auth()
            }
        };
        client_config.alpn_protocols = vec![MQTT_ALPN.to_vec()];

        info!(
            trusted_roots,
            min_version = ?min_version,
            verification = ?verification,
            "TLS configuration ready"
        );

        Ok(TransportConfig {
            client_config: Arc::new(client_config),
            trusted_roots,
            min_protocol_version: min_version,
            skip_verify: verification == TlsVerification::Permissive,
        })
    }

    /// Bind `credential` into CONNECT parameters for `identity`.
    ///
    /// An expired credential is rejected rather than sent to the broker.
    pub fn connect_params(
        identity: &DeviceIdentity,
        credential: &Credential,
        broker: &BrokerEndpoint,
        keep_alive: Duration,
        now: DateTime<Utc>,
    ) -> Result<ConnectParams, BuildError> {
        if credential.is_expired_at(now) {
            return Err(BuildError::CredentialExpired {
                expires_at: credential.expires_at(),
            });
        }

        Ok(ConnectParams {
            client_id: identity.client_id(),
            host: broker.host.clone(),
            port: broker.port,
            username: BROKER_USERNAME.to_string(),
            password: credential.token().to_string(),
            keep_alive,
            clean_session: true,
            credential_expires_at: credential.expires_at(),
        })
    }

    /// Build both halves of a secure session in one call
    pub fn build(
        identity: &DeviceIdentity,
        credential: &Credential,
        ca_bundle: &[u8],
        broker: &BrokerEndpoint,
        verification: TlsVerification,
        keep_alive: Duration,
        now: DateTime<Utc>,
    ) -> Result<(TransportConfig, ConnectParams), BuildError> {
        let transport = Self::transport_config(ca_bundle, verification, TlsVersion::Tls12)?;
        let params = Self::connect_params(identity, credential, broker, keep_alive, now)?;
        Ok((transport, params))
    }
}

fn load_trusted_roots(ca_bundle: &[u8]) -> RootCertStore {
    let mut reader = ca_bundle;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|cert| match cert {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable PEM section in CA bundle");
                None
            }
        })
        .collect();

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(added, ignored, "Some CA bundle certificates could not be parsed");
    }
    roots
}

/// Verifier used in permissive mode: any certificate chain is accepted
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
