//! Cross-transport bridge
//!
//! Platforms running a different message bus are reached through a proxy
//! router listening on `<instance>.proxy.router.pubsub`. Subscriptions,
//! unsubscriptions and publishes with all-platforms scope are forwarded to it
//! as VIP frames:
//!
//! ```text
//! [sender, recipient, "VIP1", user_id, msg_id, "pubsub", op, args-json]
//! ```
//!
//! Forwarding is fire-and-forget: no retries, and a failure never fails the
//! caller's primary operation.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::proxy_routing_key;
use crate::envelope::{Headers, MessageId, PublishProperties};
use crate::error::{PubSubError, PubSubResult};
use crate::metrics::PubSubMetricsCollector;
use crate::transport::Transport;
use crate::types::{AgentIdentity, RoutingKey};

/// Protocol tag of a VIP frame
pub const VIP_PROTOCOL: &str = "VIP1";
/// Subsystem the proxy router dispatches bridge frames to
pub const PUBSUB_SUBSYSTEM: &str = "pubsub";

const FRAME_COUNT: usize = 8;

/// Outcome of forwarding a request to the proxy router
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BridgeStatus {
    /// The request had local scope
    #[default]
    NotRequired,
    /// A frame was handed to the transport
    Forwarded,
    /// The frame could not be sent; the primary operation is unaffected
    Failed(String),
}

impl BridgeStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, BridgeStatus::Failed(_))
    }
}

/// A pub/sub request relayed to other platforms
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeRequest {
    Subscribe {
        prefix: String,
        bus: String,
        all_platforms: bool,
    },
    Unsubscribe {
        prefixes: Vec<String>,
        bus: String,
    },
    Publish {
        topic: String,
        bus: String,
        headers: Headers,
        message: Value,
    },
}

#[derive(Serialize, Deserialize)]
struct UnsubscribeArgs {
    prefix: Vec<String>,
    bus: String,
}

impl BridgeRequest {
    /// Operation name carried in the frame
    pub fn op(&self) -> &'static str {
        match self {
            BridgeRequest::Subscribe { .. } => "subscribe",
            BridgeRequest::Unsubscribe { .. } => "unsubscribe",
            BridgeRequest::Publish { .. } => "publish",
        }
    }

    fn args(&self) -> Value {
        match self {
            BridgeRequest::Subscribe {
                prefix,
                bus,
                all_platforms,
            } => json!({"prefix": prefix, "bus": bus, "all_platforms": all_platforms}),
            BridgeRequest::Unsubscribe { prefixes, bus } => {
                json!({"all": {"prefix": prefixes, "bus": bus}})
            }
            BridgeRequest::Publish {
                topic,
                bus,
                headers,
                message,
            } => json!({"topic": topic, "bus": bus, "headers": headers, "message": message}),
        }
    }

    fn from_parts(op: &str, args: Value) -> PubSubResult<Self> {
        let malformed = |what: &str| PubSubError::MalformedEnvelope(format!("bridge {}: {}", op, what));
        let text = |args: &Value, key: &str| -> PubSubResult<String> {
            args.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| malformed(&format!("missing '{}'", key)))
        };

        match op {
            "subscribe" => Ok(BridgeRequest::Subscribe {
                prefix: text(&args, "prefix")?,
                bus: text(&args, "bus")?,
                all_platforms: args
                    .get("all_platforms")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            }),
            "unsubscribe" => {
                let all = args.get("all").cloned().ok_or_else(|| malformed("missing 'all'"))?;
                let parsed: UnsubscribeArgs = serde_json::from_value(all)?;
                Ok(BridgeRequest::Unsubscribe {
                    prefixes: parsed.prefix,
                    bus: parsed.bus,
                })
            }
            "publish" => Ok(BridgeRequest::Publish {
                topic: text(&args, "topic")?,
                bus: text(&args, "bus")?,
                headers: match args.get("headers") {
                    Some(Value::Object(map)) => {
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    _ => Headers::new(),
                },
                message: args.get("message").cloned().unwrap_or(Value::Null),
            }),
            other => Err(PubSubError::MalformedEnvelope(format!(
                "unknown bridge operation '{}'",
                other
            ))),
        }
    }
}

/// A bridge request addressed to the proxy router
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeFrame {
    pub sender: String,
    pub request: BridgeRequest,
}

impl BridgeFrame {
    pub fn new(sender: impl Into<String>, request: BridgeRequest) -> Self {
        Self {
            sender: sender.into(),
            request,
        }
    }

    /// The eight VIP frames, in order
    pub fn frames(&self) -> PubSubResult<Vec<String>> {
        Ok(vec![
            self.sender.clone(),
            String::new(),
            VIP_PROTOCOL.to_string(),
            String::new(),
            String::new(),
            PUBSUB_SUBSYSTEM.to_string(),
            self.request.op().to_string(),
            serde_json::to_string(&self.request.args())?,
        ])
    }

    pub fn to_bytes(&self) -> PubSubResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.frames()?)?)
    }

    pub fn from_bytes(body: &[u8]) -> PubSubResult<Self> {
        let frames: Vec<String> = serde_json::from_slice(body)
            .map_err(|e| PubSubError::MalformedEnvelope(format!("bridge frame: {}", e)))?;
        if frames.len() != FRAME_COUNT {
            return Err(PubSubError::MalformedEnvelope(format!(
                "bridge frame has {} parts, expected {}",
                frames.len(),
                FRAME_COUNT
            )));
        }
        if frames[2] != VIP_PROTOCOL || frames[5] != PUBSUB_SUBSYSTEM {
            return Err(PubSubError::MalformedEnvelope(format!(
                "not a pubsub VIP frame: proto '{}', subsystem '{}'",
                frames[2], frames[5]
            )));
        }

        let args: Value = serde_json::from_str(&frames[7])?;
        Ok(Self {
            sender: frames[0].clone(),
            request: BridgeRequest::from_parts(&frames[6], args)?,
        })
    }
}

/// Sends bridge frames for one connection
pub struct Bridge {
    transport: Arc<dyn Transport>,
    identity: AgentIdentity,
    proxy_key: RoutingKey,
    metrics: PubSubMetricsCollector,
}

impl Bridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: AgentIdentity,
        metrics: PubSubMetricsCollector,
    ) -> Self {
        let proxy_key = proxy_routing_key(&identity.instance_name);
        Self {
            transport,
            identity,
            proxy_key,
            metrics,
        }
    }

    pub fn proxy_key(&self) -> &RoutingKey {
        &self.proxy_key
    }

    /// Forward one request. Never fails; the outcome is reported instead.
    pub async fn forward(&self, request: BridgeRequest) -> BridgeStatus {
        let op = request.op();
        let frame = BridgeFrame::new(self.identity.identity.as_str(), request);
        let body = match frame.to_bytes() {
            Ok(body) => body,
            Err(e) => return self.failed(op, e.to_string()),
        };

        let properties = PublishProperties::pubsub(self.identity.app_id(), MessageId::new());
        match self
            .transport
            .publish(&self.proxy_key, body, &properties)
            .await
        {
            Ok(_) => {
                self.metrics.record_bridge_forward();
                debug!(routing_key = %self.proxy_key, op, "Forwarded request to proxy router");
                BridgeStatus::Forwarded
            }
            Err(e) => self.failed(op, e.to_string()),
        }
    }

    fn failed(&self, op: &str, reason: String) -> BridgeStatus {
        self.metrics.record_bridge_failure();
        warn!(routing_key = %self.proxy_key, op, "Bridge forward failed: {}", reason);
        BridgeStatus::Failed(reason)
    }
}
