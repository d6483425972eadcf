//! Mock implementations for testing
//!
//! Provides a scriptable [`MockTransport`] and helpers that build a fully
//! wired [`Session`] around it, so session, subscription and publish-loop
//! behaviour can be tested without a broker.

use crate::credentials::{CredentialIssuer, CredentialProvider};
use crate::identity::DeviceIdentity;
use crate::session::{Session, SessionOptions};
use crate::transport::mqtt::RouteTable;
use crate::transport::{
    ConnectParams, InboundMessage, MessageHandler, SecureSessionBuilder, TlsVerification,
    TlsVersion, Transport, TransportConfig,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// RSA-2048 PKCS#8 key used by test sessions
pub const TEST_DEVICE_KEY_PEM: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/device_key_pkcs8.pem"
));

/// Self-signed root used by test sessions
pub const TEST_CA_PEM: &[u8] =
    include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/ca.pem"));

pub type PublishedMessage = (String, Vec<u8>);

#[derive(Debug, Error)]
#[error("mock transport: {0}")]
pub struct MockTransportError(pub String);

#[derive(Default)]
struct MockState {
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    disconnect_calls: AtomicU32,
    connect_failures: AtomicU32,
    publish_failures: AtomicU32,
    subscribe_failures: AtomicU32,
    connect_passwords: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscribe_attempts: Mutex<Vec<String>>,
    rejected_filters: Mutex<Vec<String>>,
    connect_delay: Mutex<Option<Duration>>,
    publish_delay: Mutex<Option<Duration>>,
    routes: RouteTable,
}

/// Mock transport for testing
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a session.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connect calls
    pub fn fail_next_connects(&self, n: u32) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` publish calls
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.publish_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscribe calls
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state.subscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every subscribe call
    pub fn fail_all_subscribes(&self) {
        self.state.subscribe_failures.store(u32::MAX, Ordering::SeqCst);
    }

    /// Fail every subscribe to exactly `filter`
    pub fn reject_filter(&self, filter: &str) {
        self.state
            .rejected_filters
            .lock()
            .unwrap()
            .push(filter.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.state.publish_delay.lock().unwrap() = Some(delay);
    }

    /// Simulate the broker link going away without a disconnect call
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    /// Deliver a message to matching subscribed handlers, as the broker would.
    /// Returns the number of handlers reached.
    pub fn inject(&self, topic: &str, payload: impl Into<bytes::Bytes>) -> usize {
        self.state.routes.dispatch(InboundMessage::new(topic, payload))
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Passwords (tokens) presented on each connect attempt
    pub fn connect_passwords(&self) -> Vec<String> {
        self.state.connect_passwords.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().unwrap().clone()
    }

    /// Filters passed to every subscribe call, including failed ones
    pub fn subscribe_attempts(&self) -> Vec<String> {
        self.state.subscribe_attempts.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.state.published.lock().unwrap().clear();
        self.state.subscribe_attempts.lock().unwrap().clear();
        self.state.connect_passwords.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(
        &mut self,
        _tls: &TransportConfig,
        params: &ConnectParams,
    ) -> Result<(), Self::Error> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.state
            .connect_passwords
            .lock()
            .unwrap()
            .push(params.password().to_string());

        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.state.connect_failures) {
            return Err(MockTransportError("connection refused".to_string()));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self, _linger: Duration) -> Result<(), Self::Error> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        let delay = *self.state.publish_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(MockTransportError("link closed".to_string()));
        }
        if take_failure(&self.state.publish_failures) {
            return Err(MockTransportError("publish rejected".to_string()));
        }
        self.state
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Self::Error> {
        self.state
            .subscribe_attempts
            .lock()
            .unwrap()
            .push(filter.to_string());
        let rejected = self
            .state
            .rejected_filters
            .lock()
            .unwrap()
            .iter()
            .any(|f| f == filter);
        if rejected || take_failure(&self.state.subscribe_failures) {
            return Err(MockTransportError(format!("SubAck failure for {filter}")));
        }
        self.state.routes.add(filter, handler);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

/// Identity used throughout the test suite
pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new("dev1", "eu-west1", "proj1", "reg1").expect("test identity is valid")
}

/// Strict TLS configuration trusting the fixture root
pub fn test_transport_config() -> TransportConfig {
    SecureSessionBuilder::transport_config(TEST_CA_PEM, TlsVerification::Strict, TlsVersion::Tls12)
        .expect("fixture CA should load")
}

pub fn test_credentials(identity: &DeviceIdentity) -> CredentialProvider {
    let issuer = CredentialIssuer::from_pem(identity, TEST_DEVICE_KEY_PEM)
        .expect("fixture key should load");
    CredentialProvider::new(issuer)
}

/// Session for `dev1` wired to `transport` with default options
pub fn test_session(transport: MockTransport) -> Session<MockTransport> {
    test_session_with_options(transport, SessionOptions::default())
}

pub fn test_session_with_options(
    transport: MockTransport,
    options: SessionOptions,
) -> Session<MockTransport> {
    let identity = test_identity();
    let credentials = test_credentials(&identity);
    Session::new(
        identity,
        credentials,
        test_transport_config(),
        transport,
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Count(AtomicU32);

    impl MessageHandler for Count {
        fn handle(&self, _message: InboundMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_failure_counts_down() {
        let counter = AtomicU32::new(2);
        assert!(take_failure(&counter));
        assert!(take_failure(&counter));
        assert!(!take_failure(&counter));

        let always = AtomicU32::new(u32::MAX);
        for _ in 0..5 {
            assert!(take_failure(&always));
        }
    }

    #[tokio::test]
    async fn test_inject_reaches_subscribed_handler() {
        let transport = MockTransport::new();
        let counter = Arc::new(Count(AtomicU32::new(0)));
        transport
            .subscribe("/devices/dev1/commands/#", counter.clone())
            .await
            .unwrap();

        assert_eq!(transport.inject("/devices/dev1/commands/led", "on"), 1);
        assert_eq!(transport.inject("/devices/dev1/config", "{}"), 0);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        transport.state.connected.store(true, Ordering::SeqCst);
        assert!(handle.is_connected());
        handle.drop_link();
        assert!(!transport.is_connected());
    }
}
