//! Core type definitions for topic routing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for ID and topic validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The ID string is empty
    Empty,
    /// The ID contains only whitespace
    WhitespaceOnly,
    /// The ID has leading or trailing whitespace
    LeadingTrailingWhitespace,
    /// The ID contains invalid characters
    InvalidCharacters,
    /// The topic contains the routing key delimiter or an exchange wildcard
    ReservedCharacter(char),
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "ID cannot be empty"),
            Self::WhitespaceOnly => write!(f, "ID cannot be whitespace-only"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "ID cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "ID can only contain alphanumeric characters, hyphens, underscores, and dots"
            ),
            Self::ReservedCharacter(c) => {
                write!(f, "topic cannot contain the reserved character '{}'", c)
            }
        }
    }
}

impl std::error::Error for IdValidationError {}

/// Identity of an agent (VIP identity) on the platform
///
/// Valid IDs are non-empty, carry no surrounding whitespace, and only use
/// alphanumerics, hyphens, underscores and dots (e.g. `platform.driver`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Parse and validate an agent ID
    ///
    /// # Examples
    ///
    /// ```
    /// use agentbus_pubsub::AgentId;
    ///
    /// assert!(AgentId::parse("platform.driver").is_ok());
    /// assert!(AgentId::parse("").is_err());
    /// assert!(AgentId::parse("agent/path").is_err());
    /// ```
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();

        if s.is_empty() {
            return Err(IdValidationError::Empty);
        }
        if s.trim().is_empty() {
            return Err(IdValidationError::WhitespaceOnly);
        }
        if s != s.trim() {
            return Err(IdValidationError::LeadingTrailingWhitespace);
        }
        if !s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(IdValidationError::InvalidCharacters);
        }

        Ok(Self(s.to_string()))
    }

    /// Get the agent ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for AgentId {
    /// # Panics
    /// Panics if the string fails validation. Use `AgentId::parse()` for
    /// non-panicking construction.
    fn from(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|e| panic!("Invalid AgentId '{}': {}", s, e))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Characters that cannot appear in a topic because they have meaning in
/// routing keys.
pub const RESERVED_TOPIC_CHARS: [char; 3] = ['.', '#', '*'];

/// A `/`-delimited publish/subscribe address such as
/// `devices/building/room/temperature`.
///
/// An empty topic is valid and means "every topic" when used as a
/// subscription prefix. Publishing requires a non-empty topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Parse and validate a topic
    ///
    /// # Examples
    ///
    /// ```
    /// use agentbus_pubsub::Topic;
    ///
    /// assert!(Topic::parse("devices/room1/temp").is_ok());
    /// assert!(Topic::parse("").is_ok());
    /// assert!(Topic::parse("devices.room1").is_err());
    /// assert!(Topic::parse("devices/#").is_err());
    /// ```
    pub fn parse(topic: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = topic.as_ref();

        if s.is_empty() {
            return Ok(Self::all());
        }
        if s.trim().is_empty() {
            return Err(IdValidationError::WhitespaceOnly);
        }
        if s != s.trim() {
            return Err(IdValidationError::LeadingTrailingWhitespace);
        }
        if let Some(c) = s.chars().find(|c| RESERVED_TOPIC_CHARS.contains(c)) {
            return Err(IdValidationError::ReservedCharacter(c));
        }

        Ok(Self(s.to_string()))
    }

    /// The empty topic, matching every topic as a prefix
    pub fn all() -> Self {
        Self(String::new())
    }

    /// Build a topic without validation. Used when decoding routing keys,
    /// which may come from foreign publishers.
    pub(crate) fn from_decoded(s: String) -> Self {
        Self(s)
    }

    /// Get the topic as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the wildcard (empty) topic
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` starts with `prefix` (plain string prefix, as agents
    /// subscribe to prefixes rather than whole segments)
    pub fn starts_with(&self, prefix: &Topic) -> bool {
        self.0.starts_with(prefix.as_str())
    }
}

impl FromStr for Topic {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for Topic {
    /// # Panics
    /// Panics if the string fails validation. Use `Topic::parse()` for
    /// non-panicking construction.
    fn from(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|e| panic!("Invalid Topic '{}': {}", s, e))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a subscription or publish targets this platform instance only or
/// every federated instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Local,
    AllPlatforms,
}

impl Scope {
    pub fn from_all_platforms(all_platforms: bool) -> Self {
        if all_platforms {
            Scope::AllPlatforms
        } else {
            Scope::Local
        }
    }

    pub fn is_all_platforms(self) -> bool {
        matches!(self, Scope::AllPlatforms)
    }
}

/// Transport-level address derived from a topic, scope and instance name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a broker-side delivery queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declaration attributes of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Generated per-process queue, removed by the broker when the
    /// connection goes away
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }

    /// Caller-named queue that survives restarts
    pub fn persistent() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Identity carried on outbound envelopes, as issued by the credential layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// VIP identity of the agent
    pub identity: AgentId,
    /// Name of the platform instance the agent runs on
    pub instance_name: String,
    /// Capabilities granted to this agent; carried, never enforced here
    pub capabilities: Vec<String>,
}

impl AgentIdentity {
    pub fn new(identity: AgentId, instance_name: impl Into<String>) -> Self {
        Self {
            identity,
            instance_name: instance_name.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// `app_id` stamped on published messages: `<instance>.<identity>`
    pub fn app_id(&self) -> String {
        format!("{}.{}", self.instance_name, self.identity)
    }
}
