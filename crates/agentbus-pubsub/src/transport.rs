//! Transport backend abstraction
//!
//! A transport is one agent connection to a topic exchange. The pub/sub core
//! drives it through declare/bind/publish/consume calls and observes it
//! through a single event stream carrying connection changes and publisher
//! confirmations.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{MessageId, PublishProperties, RawDelivery};
use crate::error::TransportResult;
use crate::types::{QueueName, QueueOptions, RoutingKey};

/// Sink that a transport pushes consumed messages into
pub type DeliverySink = mpsc::UnboundedSender<RawDelivery>;

/// Connection and confirmation events emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt has started
    Connecting,
    /// The connection is usable; state must be (re)synchronized
    Connected,
    /// The connection dropped; outstanding publishes will never be confirmed
    Disconnected { reason: String },
    /// The broker accepted a published message.
    ///
    /// Transports translate their delivery tags back to message ids, so a
    /// confirmation can never overtake the publisher's bookkeeping.
    Confirmed {
        message_id: MessageId,
        delivery_tag: u64,
    },
    /// The broker refused a published message
    Nacked {
        message_id: MessageId,
        delivery_tag: u64,
    },
}

/// What `publish` reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed over; a `Confirmed`/`Nacked` event with this tag will follow
    Pending { delivery_tag: u64 },
    /// Handed over; this backend never confirms
    Enqueued,
}

/// Backend trait for the brokered topic exchange
///
/// Every method must be safe to call while disconnected, in which case it
/// returns [`TransportError::NotConnected`](crate::error::TransportError::NotConnected).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the platform instance this connection belongs to
    fn instance_name(&self) -> &str;

    /// Declare a queue. Redeclaring with identical options is a no-op.
    async fn declare_queue(&self, queue: &QueueName, options: QueueOptions)
    -> TransportResult<()>;

    /// Bind a queue to a routing key pattern
    async fn bind(&self, queue: &QueueName, routing_key: &RoutingKey) -> TransportResult<()>;

    /// Remove a binding
    async fn unbind(&self, queue: &QueueName, routing_key: &RoutingKey) -> TransportResult<()>;

    /// Delete a queue together with its bindings and backlog
    async fn delete_queue(&self, queue: &QueueName) -> TransportResult<()>;

    /// Publish a body under `routing_key`
    async fn publish(
        &self,
        routing_key: &RoutingKey,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> TransportResult<PublishOutcome>;

    /// Start consuming `queue`, pushing every message into `sink`.
    /// Consuming a queue that already has a consumer replaces it.
    async fn consume(&self, queue: &QueueName, sink: DeliverySink) -> TransportResult<()>;

    /// Take the event stream. Only the first call succeeds.
    fn events(&self) -> TransportResult<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Whether `publish` returns [`PublishOutcome::Pending`]
    fn supports_confirms(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::Mutex;

    // Minimal transport used to check that the trait is object safe
    struct NullTransport {
        events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    }

    #[async_trait]
    impl Transport for NullTransport {
        fn instance_name(&self) -> &str {
            "null"
        }

        async fn declare_queue(&self, _: &QueueName, _: QueueOptions) -> TransportResult<()> {
            Ok(())
        }

        async fn bind(&self, _: &QueueName, _: &RoutingKey) -> TransportResult<()> {
            Ok(())
        }

        async fn unbind(&self, _: &QueueName, _: &RoutingKey) -> TransportResult<()> {
            Ok(())
        }

        async fn delete_queue(&self, _: &QueueName) -> TransportResult<()> {
            Err(TransportError::NotConnected)
        }

        async fn publish(
            &self,
            _: &RoutingKey,
            _: Vec<u8>,
            _: &PublishProperties,
        ) -> TransportResult<PublishOutcome> {
            Ok(PublishOutcome::Enqueued)
        }

        async fn consume(&self, _: &QueueName, _: DeliverySink) -> TransportResult<()> {
            Ok(())
        }

        fn events(&self) -> TransportResult<mpsc::UnboundedReceiver<TransportEvent>> {
            self.events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Backend("event stream already taken".into()))
        }

        fn supports_confirms(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_trait_object_usage() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let transport: Box<dyn Transport> = Box::new(NullTransport {
            events: Mutex::new(Some(rx)),
        });

        assert_eq!(transport.instance_name(), "null");
        assert!(transport.events().is_ok());
        assert!(transport.events().is_err());
        assert_eq!(
            transport
                .delete_queue(&QueueName::new("q"))
                .await
                .unwrap_err(),
            TransportError::NotConnected
        );
    }
}
