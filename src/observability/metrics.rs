//! Thread-safe metrics collection system
//!
//! Atomic counters for credential, transport, publish and inbound-message
//! activity. A snapshot is logged when the agent shuts down.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
#[derive(Debug)]
pub struct MetricsCollector {
    credentials_issued: AtomicU64,

    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,

    events_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_timeouts: AtomicU64,

    subscribe_attempts: AtomicU64,
    subscribe_failures: AtomicU64,

    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    config_updates: AtomicU64,
    config_parse_failures: AtomicU64,

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            credentials_issued: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_timeouts: AtomicU64::new(0),
            subscribe_attempts: AtomicU64::new(0),
            subscribe_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            config_updates: AtomicU64::new(0),
            config_parse_failures: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn credential_issued(&self) {
        self.credentials_issued.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT connection metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_connection_closed(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    // Publish metrics
    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_timed_out(&self) {
        self.publish_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // Subscription metrics
    pub fn subscribe_attempt(&self) {
        self.subscribe_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_failed(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Inbound metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn config_updated(&self) {
        self.config_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn config_parse_failed(&self) {
        self.config_parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: current_timestamp()
                .saturating_sub(self.started_at.load(Ordering::Relaxed)),
            credentials_issued: self.credentials_issued.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
            subscribe_attempts: self.subscribe_attempts.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            config_updates: self.config_updates.load(Ordering::Relaxed),
            config_parse_failures: self.config_parse_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub credentials_issued: u64,
    pub mqtt_connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub publish_timeouts: u64,
    pub subscribe_attempts: u64,
    pub subscribe_failures: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub config_updates: u64,
    pub config_parse_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
