//! Pure message routing logic for MQTT events
//!
//! [`EventRouter`] turns raw rumqttc events into routing decisions;
//! [`RouteTable`] maps subscription filters to the handlers that receive
//! matching inbound messages.

use crate::protocol::topic_matches;
use crate::transport::{InboundMessage, MessageHandler};
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Pure routing decisions based on MQTT events
pub struct EventRouter;

impl EventRouter {
    /// Route MQTT event to the appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    result: Self::validate_subscription(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent(*packet_id),
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck return codes (pure function)
    pub fn validate_subscription(return_codes: &[SubscribeReasonCode]) -> Result<(), String> {
        if return_codes.is_empty() {
            return Err("SubAck carried no return codes".to_string());
        }
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Broker answered a SUBSCRIBE
    SubscriptionAcknowledged {
        packet_id: u16,
        result: Result<(), String>,
    },
    /// A PUBLISH was written to the network
    PublishSent(u16),
    /// Broker closed the session
    Disconnected,
    /// Our DISCONNECT was written to the network
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}

/// Subscription filters and their handlers
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Vec<(String, Arc<dyn MessageHandler>)>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`, replacing any previous handler
    pub fn add(&self, filter: &str, handler: Arc<dyn MessageHandler>) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        match routes.iter_mut().find(|(f, _)| f == filter) {
            Some(entry) => entry.1 = handler,
            None => routes.push((filter.to_string(), handler)),
        }
    }

    pub fn remove(&self, filter: &str) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|(f, _)| f != filter);
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `message` to every handler whose filter matches its topic.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, message: InboundMessage) -> usize {
        let matching: Vec<Arc<dyn MessageHandler>> = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter(|(filter, _)| topic_matches(filter, &message.topic))
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        if matching.is_empty() {
            debug!(topic = %message.topic, "No handler for inbound message");
            return 0;
        }

        let count = matching.len();
        for handler in matching {
            handler.handle(message.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, QoS, SubAck};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        topics: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, message: InboundMessage) {
            self.topics.lock().unwrap().push(message.topic);
        }
    }

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            EventRouter::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("/devices/dev1/config", QoS::AtMostOnce, r#"{"Config":"x"}"#);
        let event = Event::Incoming(Packet::Publish(publish));
        match EventRouter::route_mqtt_event(&event) {
            EventRoute::MessageReceived { topic, payload } => {
                assert_eq!(topic, "/devices/dev1/config");
                assert_eq!(&payload[..], br#"{"Config":"x"}"#);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_route_suback() {
        let ok = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        )));
        assert_eq!(
            EventRouter::route_mqtt_event(&ok),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 7,
                result: Ok(())
            }
        );

        let rejected = Event::Incoming(Packet::SubAck(SubAck::new(
            8,
            vec![SubscribeReasonCode::Failure],
        )));
        assert!(matches!(
            EventRouter::route_mqtt_event(&rejected),
            EventRoute::SubscriptionAcknowledged { result: Err(_), .. }
        ));
    }

    #[test]
    fn test_route_outgoing() {
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(3))),
            EventRoute::PublishSent(3)
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_validate_subscription() {
        assert!(EventRouter::validate_subscription(&[]).is_err());
        assert!(EventRouter::validate_subscription(&[SubscribeReasonCode::Success(
            QoS::AtLeastOnce
        )])
        .is_ok());
        assert!(EventRouter::validate_subscription(&[
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::Failure,
        ])
        .is_err());
    }

    #[test]
    fn test_route_table_dispatch() {
        let table = RouteTable::new();
        let config = Arc::new(Recorder::default());
        let commands = Arc::new(Recorder::default());
        table.add("/devices/dev1/config", config.clone());
        table.add("/devices/dev1/commands/#", commands.clone());

        assert_eq!(table.dispatch(InboundMessage::new("/devices/dev1/config", "a")), 1);
        assert_eq!(
            table.dispatch(InboundMessage::new("/devices/dev1/commands/reboot", "b")),
            1
        );
        assert_eq!(table.dispatch(InboundMessage::new("/devices/dev2/config", "c")), 0);

        assert_eq!(*config.topics.lock().unwrap(), vec!["/devices/dev1/config"]);
        assert_eq!(
            *commands.topics.lock().unwrap(),
            vec!["/devices/dev1/commands/reboot"]
        );
    }

    #[test]
    fn test_route_table_replace_and_remove() {
        let table = RouteTable::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        table.add("/devices/d/config", first.clone());
        table.add("/devices/d/config", second.clone());
        assert_eq!(table.len(), 1);

        table.dispatch(InboundMessage::new("/devices/d/config", "x"));
        assert!(first.topics.lock().unwrap().is_empty());
        assert_eq!(second.topics.lock().unwrap().len(), 1);

        table.remove("/devices/d/config");
        assert!(table.is_empty());
    }
}
