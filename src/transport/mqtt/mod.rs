//! MQTT transport for the device session
//!
//! The module is split into focused sub-modules:
//!
//! - [`connection`] - Link state, errors and rumqttc option building
//! - [`message_handler`] - Pure event routing and the subscription route table
//! - [`pending`] - Matching event loop confirmations to queued requests
//! - [`client`] - The event loop task and the
//!   [`Transport`](crate::transport::Transport) implementation

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod pending;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, LinkState, MqttError};
pub use message_handler::{EventRoute, EventRouter, RouteTable};
pub use pending::{PendingRequests, Ticket};
