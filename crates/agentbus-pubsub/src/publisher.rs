//! Outbound publishes
//!
//! The pending entry is registered before the message reaches the
//! transport, so a confirmation can never arrive for an id nobody is
//! waiting on.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::bridge::{Bridge, BridgeRequest, BridgeStatus};
use crate::codec::encode;
use crate::envelope::{Envelope, Headers, MessageId, PublishProperties};
use crate::error::{PubSubError, PubSubResult};
use crate::metrics::PubSubMetricsCollector;
use crate::pending::{AckStatus, PendingResults, PublishResult};
use crate::transport::{PublishOutcome, Transport};
use crate::types::{AgentIdentity, Scope, Topic};

pub struct Publisher {
    transport: Arc<dyn Transport>,
    identity: AgentIdentity,
    pending: Arc<PendingResults>,
    bridge: Arc<Bridge>,
    metrics: PubSubMetricsCollector,
    sequence: AtomicU64,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: AgentIdentity,
        pending: Arc<PendingResults>,
        bridge: Arc<Bridge>,
        metrics: PubSubMetricsCollector,
    ) -> Self {
        Self {
            transport,
            identity,
            pending,
            bridge,
            metrics,
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of publishes attempted on this connection
    pub fn message_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Publish `message` on `topic`.
    ///
    /// With [`Scope::AllPlatforms`] exactly one bridge frame is sent to the
    /// proxy router before anything else, so it goes out even when the
    /// pending table is full or the primary publish fails. Its outcome is
    /// reported on the returned [`PublishResult`] and never fails the
    /// publish itself.
    pub async fn publish(
        &self,
        topic: &Topic,
        headers: Option<Headers>,
        message: Value,
        bus: &str,
        scope: Scope,
    ) -> PubSubResult<PublishResult> {
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic {
                topic: String::new(),
                reason: "cannot publish to an empty topic".to_string(),
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message_id = MessageId::new();
        let routing_key = encode(topic, Scope::Local, self.transport.instance_name());
        let envelope = Envelope::outbound(self.identity.identity.as_str(), bus, headers, message);
        let body = envelope.to_bytes()?;

        let bridge_status = if scope.is_all_platforms() {
            self.bridge
                .forward(BridgeRequest::Publish {
                    topic: topic.to_string(),
                    bus: bus.to_string(),
                    headers: envelope.headers.clone(),
                    message: envelope.message.clone(),
                })
                .await
        } else {
            BridgeStatus::NotRequired
        };

        let mut result = self.pending.register(message_id.clone())?;
        result.set_bridge_status(bridge_status);

        let properties = PublishProperties::pubsub(self.identity.app_id(), message_id.clone());
        match self
            .transport
            .publish(&routing_key, body, &properties)
            .await
        {
            Ok(PublishOutcome::Enqueued) => {
                self.pending
                    .resolve(&message_id, AckStatus::Accepted, None);
                self.metrics.record_accepted();
            }
            Ok(PublishOutcome::Pending { delivery_tag }) => {
                debug!(message_id = %message_id, delivery_tag, "Awaiting publish confirmation");
            }
            Err(e) => {
                self.pending.abandon(&message_id);
                self.metrics.record_publish_failure();
                warn!(
                    routing_key = %routing_key,
                    message_id = %message_id,
                    "Publish failed: {}", e
                );
                return Err(e.into());
            }
        }

        self.metrics.record_publish(topic.as_str());
        debug!(
            routing_key = %routing_key,
            message_id = %message_id,
            sequence,
            "Published message"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MIN_VERSION_HEADER;
    use crate::memory::{MemoryExchange, MemoryTransport};
    use crate::types::{AgentId, RoutingKey};
    use serde_json::json;
    use std::time::Duration;

    fn publisher(transport: Arc<MemoryTransport>) -> (Publisher, Arc<PendingResults>) {
        publisher_with_capacity(transport, 100)
    }

    fn publisher_with_capacity(
        transport: Arc<MemoryTransport>,
        max_pending: usize,
    ) -> (Publisher, Arc<PendingResults>) {
        let identity = AgentIdentity::new(AgentId::from("listener"), "v1");
        let metrics = PubSubMetricsCollector::with_defaults();
        let pending = PendingResults::new(max_pending);
        let bridge = Arc::new(Bridge::new(
            transport.clone(),
            identity.clone(),
            metrics.clone(),
        ));
        let publisher = Publisher::new(transport, identity, Arc::clone(&pending), bridge, metrics);
        (publisher, pending)
    }

    #[tokio::test]
    async fn test_publish_without_confirms_is_accepted() {
        let exchange = MemoryExchange::new();
        let (publisher, pending) = publisher(exchange.connect("v1"));

        let result = publisher
            .publish(&Topic::from("devices/room1"), None, json!(72.5), "", Scope::Local)
            .await
            .unwrap();
        let ack = result.get(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ack.status, AckStatus::Accepted);
        assert!(pending.is_empty());
        assert_eq!(publisher.message_count(), 1);

        let sent = exchange.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].routing_key.as_str(), "__pubsub__.v1.devices.room1.#");
        assert_eq!(sent[0].properties.app_id, "v1.listener");
        assert_eq!(sent[0].properties.kind, "pubsub");

        let envelope = Envelope::from_bytes(&sent[0].body).unwrap();
        assert_eq!(envelope.sender, "listener");
        assert_eq!(envelope.headers[MIN_VERSION_HEADER], json!("5.0"));
    }

    #[tokio::test]
    async fn test_publish_with_confirms_waits_for_event() {
        let exchange = MemoryExchange::new();
        let transport = exchange.connect_with_confirms("v1");
        let mut events = transport.events().unwrap();
        let (publisher, pending) = publisher(transport);

        let mut result = publisher
            .publish(&Topic::from("alerts"), None, json!("x"), "", Scope::Local)
            .await
            .unwrap();
        assert!(result.try_get().is_none());
        assert_eq!(pending.len(), 1);

        while let Some(event) = events.recv().await {
            if let crate::transport::TransportEvent::Confirmed {
                message_id,
                delivery_tag,
            } = event
            {
                pending.resolve(&message_id, AckStatus::Confirmed, Some(delivery_tag));
                break;
            }
        }
        let ack = result.wait().await.unwrap();
        assert_eq!(ack.status, AckStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let exchange = MemoryExchange::new();
        let (publisher, _) = publisher(exchange.connect("v1"));
        let err = publisher
            .publish(&Topic::all(), None, Value::Null, "", Scope::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::InvalidTopic { .. }));
        assert!(exchange.published().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_cleans_pending() {
        let exchange = MemoryExchange::new();
        let transport = exchange.connect("v1");
        transport.fail_publishes(true);
        let (publisher, pending) = publisher(transport);

        assert!(
            publisher
                .publish(&Topic::from("a"), None, Value::Null, "", Scope::Local)
                .await
                .is_err()
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_publish_is_connection_lost() {
        let exchange = MemoryExchange::new();
        let transport = exchange.connect("v1");
        transport.disconnect("down");
        let (publisher, _) = publisher(transport);

        assert!(matches!(
            publisher
                .publish(&Topic::from("a"), None, Value::Null, "", Scope::Local)
                .await,
            Err(PubSubError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_all_platforms_publish_forwards_one_bridge_frame() {
        let exchange = MemoryExchange::new();
        let (publisher, _) = publisher(exchange.connect("v1"));

        let result = publisher
            .publish(
                &Topic::from("devices/x"),
                None,
                json!(1),
                "",
                Scope::AllPlatforms,
            )
            .await
            .unwrap();
        assert_eq!(result.bridge_status(), &BridgeStatus::Forwarded);

        let proxy = RoutingKey::new("v1.proxy.router.pubsub");
        assert_eq!(exchange.published_to(&proxy).len(), 1);
        assert_eq!(exchange.published().len(), 2);
    }

    #[tokio::test]
    async fn test_full_pending_table_still_forwards_bridge_frame() {
        let exchange = MemoryExchange::new();
        let (publisher, pending) = publisher_with_capacity(exchange.connect("v1"), 1);
        let _held = pending.register(MessageId::new()).unwrap();

        let err = publisher
            .publish(
                &Topic::from("devices/x"),
                None,
                json!(1),
                "",
                Scope::AllPlatforms,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::PendingLimit { .. }));

        let proxy = RoutingKey::new("v1.proxy.router.pubsub");
        assert_eq!(exchange.published_to(&proxy).len(), 1);
        assert_eq!(exchange.published().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_primary_publish_still_forwards_bridge_frame() {
        let exchange = MemoryExchange::new();
        let transport = exchange.connect("v1");
        transport.fail_publishes_matching(RoutingKey::new("__pubsub__.#"));
        let (publisher, pending) = publisher(transport);

        assert!(
            publisher
                .publish(
                    &Topic::from("devices/x"),
                    None,
                    json!(1),
                    "",
                    Scope::AllPlatforms,
                )
                .await
                .is_err()
        );
        let proxy = RoutingKey::new("v1.proxy.router.pubsub");
        assert_eq!(exchange.published_to(&proxy).len(), 1);
        assert!(pending.is_empty());
    }
}
