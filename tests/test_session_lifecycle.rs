//! Session lifecycle tests against the scriptable mock transport
//!
//! Covers the connect / subscribe / publish / disconnect sequence, bounded
//! subscribe retry, inbound queue overflow, configuration delivery and
//! reconnect supervision.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use telemetry_agent::credentials::{CredentialIssuer, CredentialProvider};
use telemetry_agent::protocol::{new_event, ConfigurationSink, TopicBuilder};
use telemetry_agent::session::subscription::spawn_config_drain;
use telemetry_agent::session::{
    OverflowPolicy, ReconnectPolicy, ReconnectSupervisor, RetryPolicy, Session, SessionError,
    SessionOptions, SessionState, SubscriptionManager,
};
use telemetry_agent::testing::{
    test_identity, test_session, test_session_with_options, test_transport_config,
    MockTransport, TEST_DEVICE_KEY_PEM,
};
use tokio::sync::watch;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        retry_delay: Duration::from_millis(5),
    }
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        ..ReconnectPolicy::default()
    }
}

#[tokio::test]
async fn test_connect_publish_disconnect() {
    let transport = MockTransport::new();
    let mut session = test_session(transport.clone());
    assert_eq!(session.state(), &SessionState::Disconnected);

    session.connect().await.unwrap();
    assert_eq!(session.state(), &SessionState::Connected);
    assert!(session.credential_expires_at().is_some());

    let topic = TopicBuilder::events(session.device_id());
    session.publish(&topic, &new_event("sensor-A")).await.unwrap();

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), &SessionState::Disconnected);

    // Second disconnect is a no-op
    session.disconnect().await.unwrap();
    assert_eq!(transport.disconnect_calls(), 1);

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "/devices/dev1/events");
}

#[tokio::test]
async fn test_publish_requires_connection() {
    let transport = MockTransport::new();
    let session = test_session(transport.clone());

    let err = session
        .publish("/devices/dev1/events", &new_event("sensor-A"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotConnected(SessionState::Disconnected)));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_failed_connect_leaves_failed_state() {
    let transport = MockTransport::new();
    transport.fail_next_connects(1);
    let mut session = test_session(transport.clone());

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(_)));
    assert!(matches!(session.state(), SessionState::Failed(_)));

    session.connect().await.unwrap();
    assert_eq!(session.state(), &SessionState::Connected);
}

#[tokio::test]
async fn test_slow_connect_times_out() {
    let transport = MockTransport::new();
    transport.set_connect_delay(Duration::from_millis(200));
    let mut session = test_session_with_options(
        transport.clone(),
        SessionOptions {
            connect_timeout: Duration::from_millis(20),
            ..SessionOptions::default()
        },
    );

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectTimeout(_)));
    assert!(matches!(session.state(), SessionState::Failed(_)));
}

#[tokio::test]
async fn test_unconfirmed_publish_times_out() {
    let transport = MockTransport::new();
    transport.set_publish_delay(Duration::from_millis(200));
    let mut session = test_session_with_options(
        transport.clone(),
        SessionOptions {
            publish_timeout: Duration::from_millis(20),
            ..SessionOptions::default()
        },
    );
    session.connect().await.unwrap();

    let err = session
        .publish("/devices/dev1/events", &new_event("sensor-A"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PublishTimeout { .. }));
    // Publish failures never change the connection state
    assert_eq!(session.state(), &SessionState::Connected);
}

#[tokio::test]
async fn test_subscribe_always_failing_stops_at_max_attempts() {
    for max_attempts in [1, 3, 5] {
        let transport = MockTransport::new();
        transport.fail_all_subscribes();
        let mut session = test_session(transport.clone());
        session.connect().await.unwrap();

        let err = SubscriptionManager::new(fast_retry(max_attempts))
            .subscribe_config(&mut session)
            .await
            .unwrap_err();

        match err {
            SessionError::Subscribe { topic, attempts, .. } => {
                assert_eq!(topic, "/devices/dev1/config");
                assert_eq!(attempts, max_attempts);
            }
            other => panic!("expected Subscribe error, got {other:?}"),
        }
        assert_eq!(transport.subscribe_attempts().len() as u32, max_attempts);
        assert!(session.subscribed_topics().is_empty());
    }
}

#[tokio::test]
async fn test_subscribe_succeeding_on_attempt_k_stops_there() {
    for k in 1..=3u32 {
        let transport = MockTransport::new();
        transport.fail_next_subscribes(k - 1);
        let mut session = test_session(transport.clone());
        session.connect().await.unwrap();

        SubscriptionManager::new(fast_retry(3))
            .subscribe_config(&mut session)
            .await
            .unwrap();

        assert_eq!(transport.subscribe_attempts().len() as u32, k);
        assert_eq!(session.subscribed_topics(), vec!["/devices/dev1/config"]);
    }
}

#[tokio::test]
async fn test_shutdown_cancels_subscribe_retry() {
    let transport = MockTransport::new();
    transport.fail_all_subscribes();
    let mut session = test_session(transport.clone());
    session.connect().await.unwrap();

    let (tx, rx) = watch::channel(false);
    let manager = SubscriptionManager::new(RetryPolicy {
        max_attempts: 3,
        retry_delay: Duration::from_secs(10),
    })
    .with_shutdown(rx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    });

    let err = tokio::time::timeout(Duration::from_secs(2), manager.subscribe_config(&mut session))
        .await
        .expect("cancellation should interrupt the retry wait")
        .unwrap_err();
    assert!(matches!(err, SessionError::Cancelled));
    assert_eq!(transport.subscribe_attempts().len(), 1);
}

#[tokio::test]
async fn test_command_queue_drops_oldest_when_full() {
    let transport = MockTransport::new();
    let mut session = test_session_with_options(
        transport.clone(),
        SessionOptions {
            queue_capacity: 2,
            ..SessionOptions::default()
        },
    );
    session.connect().await.unwrap();
    SubscriptionManager::new(fast_retry(1))
        .subscribe_commands(&mut session)
        .await
        .unwrap();

    for command in ["one", "two", "three"] {
        assert_eq!(
            transport.inject(&format!("/devices/dev1/commands/{command}"), command),
            1
        );
    }

    let queue = session.command_queue();
    assert_eq!(queue.len(), 2);
    let remaining: Vec<_> = queue.drain().into_iter().map(|m| m.payload).collect();
    assert_eq!(remaining, vec!["two", "three"]);
}

#[tokio::test]
async fn test_config_queue_drop_newest_keeps_backlog() {
    let transport = MockTransport::new();
    let mut session = test_session_with_options(
        transport.clone(),
        SessionOptions {
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::DropNewest,
            ..SessionOptions::default()
        },
    );
    session.connect().await.unwrap();
    SubscriptionManager::new(fast_retry(1))
        .subscribe_config(&mut session)
        .await
        .unwrap();

    transport.inject("/devices/dev1/config", r#"{"Config":"first"}"#);
    transport.inject("/devices/dev1/config", r#"{"Config":"second"}"#);

    let queued = session.config_queue().drain();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload, r#"{"Config":"first"}"#);
}

#[tokio::test]
async fn test_configuration_flows_to_sink_and_survives_bad_payloads() {
    let transport = MockTransport::new();
    let mut session = test_session(transport.clone());
    session.connect().await.unwrap();
    SubscriptionManager::new(fast_retry(1))
        .subscribe_config(&mut session)
        .await
        .unwrap();

    let sink = Arc::new(ConfigurationSink::new());
    let mut updates = sink.watch();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = spawn_config_drain(
        Arc::clone(session.config_queue()),
        Arc::clone(&sink),
        shutdown_rx,
    );

    transport.inject("/devices/dev1/config", r#"{"Config":"rate=5"}"#);
    tokio::time::timeout(Duration::from_secs(1), updates.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sink.current().config, "rate=5");

    transport.inject("/devices/dev1/config", "not json");
    transport.inject("/devices/dev1/config", "");

    shutdown_tx.send(true).unwrap();
    drain.await.unwrap();
    assert_eq!(sink.current().config, "rate=5");
}

#[test]
fn test_sink_last_write_wins() {
    let sink = ConfigurationSink::new();
    assert_eq!(sink.current().config, "");

    assert!(sink.apply(br#"{"Config":"a"}"#));
    assert!(sink.apply(br#"{"Config":"b"}"#));
    assert!(!sink.apply(b"{\"Config\":"));
    assert_eq!(sink.current().config, "b");
}

#[tokio::test]
async fn test_supervisor_backs_off_until_connected() {
    let transport = MockTransport::new();
    transport.fail_next_connects(2);
    let mut session = test_session(transport.clone());

    let (_tx, rx) = watch::channel(false);
    let supervisor = ReconnectSupervisor::new(fast_reconnect(), fast_retry(1), rx);
    supervisor.connect(&mut session).await.unwrap();

    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(session.state(), &SessionState::Connected);
}

#[tokio::test]
async fn test_supervisor_gives_up_after_max_attempts() {
    let transport = MockTransport::new();
    transport.fail_next_connects(10);
    let mut session = test_session(transport.clone());

    let (_tx, rx) = watch::channel(false);
    let supervisor = ReconnectSupervisor::new(
        ReconnectPolicy {
            max_attempts: Some(4),
            ..fast_reconnect()
        },
        fast_retry(1),
        rx,
    );
    let err = supervisor.connect(&mut session).await.unwrap_err();

    assert!(matches!(err, SessionError::Connection(_)));
    assert_eq!(transport.connect_attempts(), 4);
}

#[tokio::test]
async fn test_lost_link_reconnects_and_replays_subscriptions() {
    let transport = MockTransport::new();
    let mut session = test_session(transport.clone());
    let (_tx, rx) = watch::channel(false);
    let mut supervisor = ReconnectSupervisor::new(fast_reconnect(), fast_retry(3), rx.clone());

    supervisor.connect(&mut session).await.unwrap();
    let manager = SubscriptionManager::new(fast_retry(3));
    manager.subscribe_config(&mut session).await.unwrap();
    manager.subscribe_commands(&mut session).await.unwrap();
    transport.clear_history();

    // Healthy link: nothing to do
    assert!(!supervisor.ensure_connected(&mut session).await.unwrap());

    transport.drop_link();
    assert!(supervisor.ensure_connected(&mut session).await.unwrap());

    assert_eq!(supervisor.reconnects(), 1);
    assert_eq!(session.state(), &SessionState::Connected);
    assert_eq!(
        transport.subscribe_attempts(),
        vec!["/devices/dev1/config", "/devices/dev1/commands/#"]
    );
    // One reconnect, presenting a single token
    assert_eq!(transport.connect_passwords().len(), 1);
}

#[tokio::test]
async fn test_token_near_expiry_is_rotated_by_reconnecting() {
    let identity = test_identity();
    let issuer = CredentialIssuer::from_pem(&identity, TEST_DEVICE_KEY_PEM)
        .unwrap()
        .with_lifetime(ChronoDuration::minutes(5));
    // Refresh margin wider than the lifetime: every token is due for rotation
    let credentials =
        CredentialProvider::new(issuer).with_refresh_margin(ChronoDuration::minutes(10));

    let transport = MockTransport::new();
    let mut session = Session::new(
        identity,
        credentials,
        test_transport_config(),
        transport.clone(),
        SessionOptions::default(),
    );
    let (_tx, rx) = watch::channel(false);
    let mut supervisor = ReconnectSupervisor::new(fast_reconnect(), fast_retry(1), rx);

    supervisor.connect(&mut session).await.unwrap();
    assert!(supervisor.ensure_connected(&mut session).await.unwrap());

    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(transport.disconnect_calls(), 1);
    assert_eq!(session.state(), &SessionState::Connected);
}
