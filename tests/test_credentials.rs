//! Device credential and secure session assembly tests
//!
//! Tokens are checked the way the broker checks them: split the compact
//! form, verify the RS256 signature with the device's public key and read
//! the claim window.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
use std::time::Duration;
use telemetry_agent::credentials::{issue, Claims, CredentialError, CredentialIssuer};
use telemetry_agent::testing::{test_identity, TEST_CA_PEM, TEST_DEVICE_KEY_PEM};
use telemetry_agent::transport::{
    BrokerEndpoint, BuildError, SecureSessionBuilder, TlsVerification,
};

const PKCS1_KEY_PEM: &[u8] = include_bytes!("fixtures/device_key_pkcs1.pem");
const EC_KEY_PEM: &[u8] = include_bytes!("fixtures/ec_key.pem");

fn decode_segment(segment: &str) -> Vec<u8> {
    URL_SAFE_NO_PAD.decode(segment).unwrap()
}

#[test]
fn test_token_verifies_with_device_public_key() {
    let identity = test_identity();
    let issuer = CredentialIssuer::from_pem(&identity, TEST_DEVICE_KEY_PEM).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
    let credential = issuer.issue(now).unwrap();

    let parts: Vec<&str> = credential.token().split('.').collect();
    assert_eq!(parts.len(), 3);

    let header: serde_json::Value = serde_json::from_slice(&decode_segment(parts[0])).unwrap();
    assert_eq!(header["alg"], "RS256");
    assert_eq!(header["typ"], "JWT");

    let claims: Claims = serde_json::from_slice(&decode_segment(parts[1])).unwrap();
    assert_eq!(claims.aud, "proj1");
    assert_eq!(claims.iat, now.timestamp());
    assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let public_key = UnparsedPublicKey::new(
        &RSA_PKCS1_2048_8192_SHA256,
        issuer.signing_key().public_key_der(),
    );
    public_key
        .verify(signing_input.as_bytes(), &decode_segment(parts[2]))
        .expect("signature should verify");
}

#[test]
fn test_tampered_claims_fail_verification() {
    let identity = test_identity();
    let issuer = CredentialIssuer::from_pem(&identity, TEST_DEVICE_KEY_PEM).unwrap();
    let credential = issuer.issue(Utc::now()).unwrap();
    let parts: Vec<&str> = credential.token().split('.').collect();

    let forged_claims = URL_SAFE_NO_PAD.encode(r#"{"aud":"other","iat":0,"exp":9999999999}"#);
    let forged_input = format!("{}.{}", parts[0], forged_claims);
    let public_key = UnparsedPublicKey::new(
        &RSA_PKCS1_2048_8192_SHA256,
        issuer.signing_key().public_key_der(),
    );
    assert!(public_key
        .verify(forged_input.as_bytes(), &decode_segment(parts[2]))
        .is_err());
}

#[test]
fn test_pkcs1_key_issues_tokens() {
    let credential = issue(&test_identity(), PKCS1_KEY_PEM, Utc::now()).unwrap();
    assert_eq!(credential.token().split('.').count(), 3);
}

#[test]
fn test_non_rsa_key_rejected() {
    let err = issue(&test_identity(), EC_KEY_PEM, Utc::now()).unwrap_err();
    assert!(matches!(err, CredentialError::KeyLoad(_)));

    let err = issue(&test_identity(), b"-----BEGIN NOTHING-----", Utc::now()).unwrap_err();
    assert!(matches!(err, CredentialError::KeyLoad(_)));
}

#[test]
fn test_connect_params_bind_identity_and_token() {
    let identity = test_identity();
    let now = Utc::now();
    let credential = issue(&identity, TEST_DEVICE_KEY_PEM, now).unwrap();

    let params = SecureSessionBuilder::connect_params(
        &identity,
        &credential,
        &BrokerEndpoint::default(),
        Duration::from_secs(60),
        now,
    )
    .unwrap();

    assert_eq!(
        params.client_id,
        "projects/proj1/locations/eu-west1/registries/reg1/devices/dev1"
    );
    assert_eq!(params.host, "mqtt.googleapis.com");
    assert_eq!(params.port, 443);
    assert_eq!(params.username, "unused");
    assert_eq!(params.password(), credential.token());
    assert_eq!(params.credential_expires_at, credential.expires_at());

    // The token must never show up in debug output
    assert!(!format!("{params:?}").contains(credential.token()));
}

#[test]
fn test_expired_credential_is_rejected() {
    let identity = test_identity();
    let now = Utc::now();
    let stale = CredentialIssuer::from_pem(&identity, TEST_DEVICE_KEY_PEM)
        .unwrap()
        .issue(now - ChronoDuration::hours(25))
        .unwrap();
    assert!(stale.is_expired_at(now));

    let err = SecureSessionBuilder::connect_params(
        &identity,
        &stale,
        &BrokerEndpoint::default(),
        Duration::from_secs(60),
        now,
    )
    .unwrap_err();
    match err {
        BuildError::CredentialExpired { expires_at } => {
            assert_eq!(expires_at, stale.expires_at())
        }
        other => panic!("expected CredentialExpired, got {other:?}"),
    }

    let err = SecureSessionBuilder::build(
        &identity,
        &stale,
        TEST_CA_PEM,
        &BrokerEndpoint::default(),
        TlsVerification::Strict,
        Duration::from_secs(60),
        now,
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::CredentialExpired { .. }));
}

#[test]
fn test_credential_valid_until_the_last_second() {
    let identity = test_identity();
    let issued = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let credential = CredentialIssuer::from_pem(&identity, TEST_DEVICE_KEY_PEM)
        .unwrap()
        .with_lifetime(ChronoDuration::minutes(20))
        .issue(issued)
        .unwrap();

    let almost = issued + ChronoDuration::minutes(20) - ChronoDuration::seconds(1);
    assert!(SecureSessionBuilder::connect_params(
        &identity,
        &credential,
        &BrokerEndpoint::default(),
        Duration::from_secs(60),
        almost,
    )
    .is_ok());

    let at_expiry = issued + ChronoDuration::minutes(20);
    assert!(SecureSessionBuilder::connect_params(
        &identity,
        &credential,
        &BrokerEndpoint::default(),
        Duration::from_secs(60),
        at_expiry,
    )
    .is_err());
}

#[test]
fn test_strict_build_needs_a_trusted_root() {
    let identity = test_identity();
    let now = Utc::now();
    let credential = issue(&identity, TEST_DEVICE_KEY_PEM, now).unwrap();

    let err = SecureSessionBuilder::build(
        &identity,
        &credential,
        b"",
        &BrokerEndpoint::default(),
        TlsVerification::Strict,
        Duration::from_secs(60),
        now,
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::Tls(_)));

    let (transport, params) = SecureSessionBuilder::build(
        &identity,
        &credential,
        b"",
        &BrokerEndpoint::default(),
        TlsVerification::Permissive,
        Duration::from_secs(60),
        now,
    )
    .unwrap();
    assert!(transport.skip_verify());
    assert_eq!(transport.trusted_roots(), 0);
    assert_eq!(params.keep_alive, Duration::from_secs(60));
}
