//! Topic ↔ routing key conversion
//!
//! Topics are `/`-delimited; routing keys are `.`-delimited and carry two
//! leading segments (namespace, instance) plus a trailing `#` so that a
//! binding for a prefix matches every topic below it:
//!
//! | topic                 | scope          | routing key                              |
//! |-----------------------|----------------|------------------------------------------|
//! | `devices/room1`       | local          | `__pubsub__.volttron1.devices.room1.#`   |
//! | `devices/room1`       | all platforms  | `__pubsub__.*.devices.room1.#`           |
//! | ``                    | local          | `__pubsub__.volttron1.#`                 |

use uuid::Uuid;

use crate::types::{AgentId, QueueName, RoutingKey, Scope, Topic};

/// Leading routing key segment for pub/sub traffic
pub const PUBSUB_NAMESPACE: &str = "__pubsub__";
/// Delimiter between routing key segments
pub const KEY_DELIMITER: char = '.';
/// Delimiter between topic segments
pub const TOPIC_DELIMITER: char = '/';
/// Matches zero or more routing key segments
pub const WILDCARD_MULTI: &str = "#";
/// Matches exactly one routing key segment
pub const WILDCARD_ONE: &str = "*";

const PROXY_SUFFIX: &str = "proxy.router.pubsub";

/// Encode a topic into the routing key used for bindings and publishes.
pub fn encode(topic: &Topic, scope: Scope, instance_name: &str) -> RoutingKey {
    let platform = match scope {
        Scope::Local => instance_name,
        Scope::AllPlatforms => WILDCARD_ONE,
    };

    if topic.is_empty() {
        return RoutingKey::new(format!(
            "{PUBSUB_NAMESPACE}{KEY_DELIMITER}{platform}{KEY_DELIMITER}{WILDCARD_MULTI}"
        ));
    }

    let dotted = topic.as_str().replace(TOPIC_DELIMITER, ".");
    RoutingKey::new(format!(
        "{PUBSUB_NAMESPACE}{KEY_DELIMITER}{platform}{KEY_DELIMITER}{dotted}{KEY_DELIMITER}{WILDCARD_MULTI}"
    ))
}

/// Recover the original topic from a routing key.
///
/// Strips the namespace and instance segments and the trailing `#` added by
/// [`encode`]. Keys with fewer than three segments are returned unchanged;
/// callers should log those.
pub fn decode(key: &RoutingKey) -> Topic {
    let segments: Vec<&str> = key.as_str().split(KEY_DELIMITER).collect();
    if segments.len() < 3 {
        return Topic::from_decoded(key.as_str().to_string());
    }

    let mut body = &segments[2..];
    if body.last() == Some(&WILDCARD_MULTI) {
        body = &body[..body.len() - 1];
    }

    Topic::from_decoded(body.join("/"))
}

/// Whether [`decode`] can strip a well-formed prefix from `key`
pub fn is_well_formed(key: &RoutingKey) -> bool {
    let mut segments = key.as_str().split(KEY_DELIMITER);
    segments.next() == Some(PUBSUB_NAMESPACE) && segments.nth(1).is_some()
}

/// Routing key of the proxy router that relays traffic to platforms using
/// the other transport
pub fn proxy_routing_key(instance_name: &str) -> RoutingKey {
    RoutingKey::new(format!("{instance_name}{KEY_DELIMITER}{PROXY_SUFFIX}"))
}

/// Generate a unique ephemeral queue name for `identity`
pub fn ephemeral_queue_name(identity: &AgentId) -> QueueName {
    QueueName::new(format!("pubsub.{}.{}", identity, Uuid::new_v4()))
}

/// Topic-exchange matching of a published routing key against a binding
/// pattern. `*` matches exactly one segment, `#` matches zero or more.
pub fn key_matches(binding: &RoutingKey, routing_key: &RoutingKey) -> bool {
    let pattern: Vec<&str> = binding.as_str().split(KEY_DELIMITER).collect();
    let key: Vec<&str> = routing_key.as_str().split(KEY_DELIMITER).collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // '#' absorbs zero or more segments; try every split point
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first() == Some(segment) && match_segments(rest, &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_local() {
        let key = encode(&Topic::from("devices/room1/temp"), Scope::Local, "volttron1");
        assert_eq!(key.as_str(), "__pubsub__.volttron1.devices.room1.temp.#");
    }

    #[test]
    fn test_encode_all_platforms() {
        let key = encode(&Topic::from("devices"), Scope::AllPlatforms, "volttron1");
        assert_eq!(key.as_str(), "__pubsub__.*.devices.#");
    }

    #[test]
    fn test_encode_empty_topic_is_open_wildcard() {
        assert_eq!(
            encode(&Topic::all(), Scope::Local, "v1").as_str(),
            "__pubsub__.v1.#"
        );
        assert_eq!(
            encode(&Topic::all(), Scope::AllPlatforms, "v1").as_str(),
            "__pubsub__.*.#"
        );
    }

    #[test]
    fn test_decode_inverts_encode() {
        for raw in ["devices/room1/temp", "alerts", "", "a//b", "trailing/"] {
            let topic = Topic::parse(raw).unwrap();
            for scope in [Scope::Local, Scope::AllPlatforms] {
                let key = encode(&topic, scope, "volttron1");
                assert_eq!(decode(&key), topic, "roundtrip of '{}' via {}", raw, key);
            }
        }
    }

    #[test]
    fn test_decode_malformed_returns_input() {
        let key = RoutingKey::new("short.key");
        assert_eq!(decode(&key).as_str(), "short.key");
        assert!(!is_well_formed(&key));
    }

    #[test]
    fn test_decode_foreign_key_without_wildcard() {
        let key = RoutingKey::new("__pubsub__.remote.devices.room2");
        assert_eq!(decode(&key).as_str(), "devices/room2");
        assert!(is_well_formed(&key));
    }

    #[test]
    fn test_proxy_routing_key() {
        assert_eq!(
            proxy_routing_key("volttron1").as_str(),
            "volttron1.proxy.router.pubsub"
        );
    }

    #[test]
    fn test_ephemeral_queue_names_are_unique() {
        let id = AgentId::from("listener");
        let a = ephemeral_queue_name(&id);
        let b = ephemeral_queue_name(&id);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("pubsub.listener."));
    }

    #[test]
    fn test_key_matches_prefix_binding() {
        let binding = encode(&Topic::from("devices"), Scope::Local, "v1");
        let published = encode(&Topic::from("devices/room1/temp"), Scope::Local, "v1");
        assert!(key_matches(&binding, &published));

        let other = encode(&Topic::from("alerts/zone1"), Scope::Local, "v1");
        assert!(!key_matches(&binding, &other));
    }

    #[test]
    fn test_key_matches_exact_topic() {
        let binding = encode(&Topic::from("devices/room1"), Scope::Local, "v1");
        let published = encode(&Topic::from("devices/room1"), Scope::Local, "v1");
        assert!(key_matches(&binding, &published));
    }

    #[test]
    fn test_key_matches_all_platforms_binding() {
        let binding = encode(&Topic::from("devices"), Scope::AllPlatforms, "v1");
        let local = encode(&Topic::from("devices/x"), Scope::Local, "v1");
        let remote = encode(&Topic::from("devices/x"), Scope::Local, "v2");
        assert!(key_matches(&binding, &local));
        assert!(key_matches(&binding, &remote));
    }

    #[test]
    fn test_key_matches_other_instance_excluded() {
        let binding = encode(&Topic::from("devices"), Scope::Local, "v1");
        let remote = encode(&Topic::from("devices/x"), Scope::Local, "v2");
        assert!(!key_matches(&binding, &remote));
    }

    #[test]
    fn test_key_matches_segment_prefix_is_not_a_match() {
        // "dev" is a string prefix of "devices" but not a segment prefix
        let binding = encode(&Topic::from("dev"), Scope::Local, "v1");
        let published = encode(&Topic::from("devices/x"), Scope::Local, "v1");
        assert!(!key_matches(&binding, &published));
    }

    #[test]
    fn test_key_matches_wildcard_everything() {
        let binding = encode(&Topic::all(), Scope::Local, "v1");
        assert!(key_matches(
            &binding,
            &encode(&Topic::from("anything/at/all"), Scope::Local, "v1")
        ));
        assert!(!key_matches(&binding, &proxy_routing_key("v1")));
    }
}
