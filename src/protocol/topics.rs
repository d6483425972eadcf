//! Device topic scheme and MQTT topic-filter matching
//!
//! Topics are fixed per device:
//! - `/devices/{device_id}/events` (publish)
//! - `/devices/{device_id}/config` (subscribe)
//! - `/devices/{device_id}/commands/#` (subscribe, wildcard)

pub struct TopicBuilder;

impl TopicBuilder {
    /// Telemetry event topic: `/devices/{device_id}/events`
    pub fn events(device_id: &str) -> String {
        format!("/devices/{device_id}/events")
    }

    /// Configuration push topic: `/devices/{device_id}/config`
    pub fn config(device_id: &str) -> String {
        format!("/devices/{device_id}/config")
    }

    /// Command topic filter: `/devices/{device_id}/commands/#`
    pub fn commands(device_id: &str) -> String {
        format!("/devices/{device_id}/commands/#")
    }
}

/// Match a concrete topic name against an MQTT topic filter.
///
/// `+` matches exactly one level; a trailing `#` matches the parent level and
/// everything below it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_device_topics() {
        assert_eq!(TopicBuilder::events("dev1"), "/devices/dev1/events");
        assert_eq!(TopicBuilder::config("dev1"), "/devices/dev1/config");
        assert_eq!(TopicBuilder::commands("dev1"), "/devices/dev1/commands/#");
    }

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("/devices/dev1/config", "/devices/dev1/config"));
        assert!(!topic_matches("/devices/dev1/config", "/devices/dev2/config"));
        assert!(!topic_matches("/devices/dev1/config", "/devices/dev1/config/extra"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let filter = TopicBuilder::commands("dev1");
        assert!(topic_matches(&filter, "/devices/dev1/commands"));
        assert!(topic_matches(&filter, "/devices/dev1/commands/reboot"));
        assert!(topic_matches(&filter, "/devices/dev1/commands/a/b/c"));
        assert!(!topic_matches(&filter, "/devices/dev1/config"));
        assert!(!topic_matches(&filter, "/devices/dev2/commands/reboot"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("/devices/+/config", "/devices/dev1/config"));
        assert!(!topic_matches("/devices/+/config", "/devices/dev1/x/config"));
        assert!(!topic_matches("/devices/+", "/devices"));
    }

    #[test]
    fn test_hash_must_be_last() {
        assert!(!topic_matches("/devices/#/config", "/devices/dev1/config"));
    }

    proptest! {
        #[test]
        fn every_topic_matches_itself(topic in "(/[a-z0-9]{1,8}){1,6}") {
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn command_filter_matches_any_subtopic(
            device in "[a-z0-9]{1,8}",
            rest in "(/[a-z0-9]{1,8}){0,4}",
        ) {
            let topic = format!("/devices/{device}/commands{rest}");
            prop_assert!(topic_matches(&TopicBuilder::commands(&device), &topic));
        }
    }
}
