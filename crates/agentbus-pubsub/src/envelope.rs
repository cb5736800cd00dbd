//! Wire envelope and delivery types
//!
//! Every publish is wrapped in an [`Envelope`] carrying the sender identity,
//! bus name, headers and message body, serialized as JSON. Transport-level
//! metadata travels separately in [`PublishProperties`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{PubSubError, PubSubResult};
use crate::types::{QueueName, RoutingKey, Topic};

/// Oldest platform version able to read messages from this bus
pub const MIN_COMPATIBLE_VERSION: &str = "5.0";
/// Newest platform version able to read messages from this bus (open-ended)
pub const MAX_COMPATIBLE_VERSION: &str = "";

pub const MIN_VERSION_HEADER: &str = "min_compatible_version";
pub const MAX_VERSION_HEADER: &str = "max_compatible_version";

/// Message headers (string keys, arbitrary JSON values)
pub type Headers = HashMap<String, Value>;

/// Unique identifier for a published message (UUID v4)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and validate a message ID
    pub fn parse(id: impl AsRef<str>) -> Option<Self> {
        let s = id.as_ref();
        Uuid::parse_str(s).ok().map(|_| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of a pub/sub message as it travels through the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub bus: String,
    pub headers: Headers,
    pub message: Value,
}

impl Envelope {
    /// Build an outbound envelope. Version headers are written after the
    /// caller's headers so they always win.
    pub fn outbound(
        sender: impl Into<String>,
        bus: impl Into<String>,
        headers: Option<Headers>,
        message: Value,
    ) -> Self {
        let mut headers = headers.unwrap_or_default();
        headers.insert(
            MIN_VERSION_HEADER.to_string(),
            Value::String(MIN_COMPATIBLE_VERSION.to_string()),
        );
        headers.insert(
            MAX_VERSION_HEADER.to_string(),
            Value::String(MAX_COMPATIBLE_VERSION.to_string()),
        );

        Self {
            sender: sender.into(),
            bus: bus.into(),
            headers,
            message,
        }
    }

    pub fn to_bytes(&self) -> PubSubResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an inbound body, reporting every missing required field
    pub fn from_bytes(body: &[u8]) -> PubSubResult<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| PubSubError::MalformedEnvelope(format!("invalid JSON: {}", e)))?;

        let Value::Object(mut fields) = value else {
            return Err(PubSubError::MalformedEnvelope(
                "envelope is not a JSON object".to_string(),
            ));
        };

        let missing: Vec<&str> = ["headers", "message", "sender", "bus"]
            .into_iter()
            .filter(|key| !fields.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(PubSubError::MalformedEnvelope(format!(
                "missing keys: {}",
                missing.join(", ")
            )));
        }

        let sender = take_string(&mut fields, "sender")?;
        let bus = take_string(&mut fields, "bus")?;
        let headers = match fields.remove("headers") {
            Some(Value::Object(map)) => map.into_iter().collect(),
            Some(Value::Null) => Headers::new(),
            _ => {
                return Err(PubSubError::MalformedEnvelope(
                    "headers must be an object".to_string(),
                ));
            }
        };
        let message = fields.remove("message").unwrap_or(Value::Null);

        Ok(Self {
            sender,
            bus,
            headers,
            message,
        })
    }
}

fn take_string(fields: &mut serde_json::Map<String, Value>, key: &str) -> PubSubResult<String> {
    match fields.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Null) => Ok(String::new()),
        _ => Err(PubSubError::MalformedEnvelope(format!(
            "'{}' must be a string",
            key
        ))),
    }
}

/// Transport metadata attached to every publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishProperties {
    /// Connection-level sender (`<instance>.<identity>`)
    pub app_id: String,
    pub message_id: MessageId,
    /// Subsystem tag, always `pubsub` for this core
    #[serde(rename = "type")]
    pub kind: String,
    pub content_type: String,
    pub user_id: String,
}

impl PublishProperties {
    pub fn pubsub(app_id: impl Into<String>, message_id: MessageId) -> Self {
        Self {
            app_id: app_id.into(),
            message_id,
            kind: "pubsub".to_string(),
            content_type: "application/json".to_string(),
            user_id: String::new(),
        }
    }
}

/// A delivery as handed over by a transport, before decoding
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Queue the message was consumed from
    pub queue: QueueName,
    /// Routing key the message was published under
    pub routing_key: RoutingKey,
    pub body: Vec<u8>,
    pub properties: Option<PublishProperties>,
}

/// A decoded delivery as seen by subscriber callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub peer: String,
    pub sender: String,
    pub bus: String,
    pub topic: Topic,
    pub headers: Headers,
    pub message: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_headers_cannot_be_overridden() {
        let mut headers = Headers::new();
        headers.insert(MIN_VERSION_HEADER.to_string(), json!("1.0"));
        headers.insert("Date".to_string(), json!("2024-01-01"));

        let env = Envelope::outbound("listener", "", Some(headers), json!(72.5));
        assert_eq!(env.headers[MIN_VERSION_HEADER], json!("5.0"));
        assert_eq!(env.headers[MAX_VERSION_HEADER], json!(""));
        assert_eq!(env.headers["Date"], json!("2024-01-01"));
    }

    #[test]
    fn test_envelope_bytes_roundtrip() {
        let env = Envelope::outbound("listener", "", None, json!({"level": "high"}));
        let bytes = env.to_bytes().unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn test_missing_fields_reported() {
        let body = br#"{"sender": "a", "message": 1}"#;
        let err = Envelope::from_bytes(body).unwrap_err();
        match err {
            PubSubError::MalformedEnvelope(msg) => {
                assert!(msg.contains("headers"));
                assert!(msg.contains("bus"));
                assert!(!msg.contains("sender"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_object_and_invalid_json_rejected() {
        assert!(matches!(
            Envelope::from_bytes(b"[1,2]"),
            Err(PubSubError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Envelope::from_bytes(b"not json"),
            Err(PubSubError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_null_message_is_accepted() {
        let body = br#"{"sender": "a", "bus": "", "headers": {}, "message": null}"#;
        let env = Envelope::from_bytes(body).unwrap();
        assert_eq!(env.message, Value::Null);
    }

    #[test]
    fn test_message_id_parse() {
        let id = MessageId::new();
        assert_eq!(MessageId::parse(id.as_str()), Some(id));
        assert!(MessageId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_properties_serialize_type_field() {
        let props = PublishProperties::pubsub("v1.listener", MessageId::new());
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["type"], "pubsub");
        assert_eq!(json["content_type"], "application/json");
    }
}
