//! Inbound dispatch
//!
//! A single loop drains the delivery channel shared by every consumed queue,
//! so per-queue order is the transport's order. Each delivery is decoded,
//! validated and handed to the live callbacks of the queue it arrived on.
//! A failing or panicking callback is logged and does not stop the others.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::codec::{decode, is_well_formed};
use crate::envelope::{Delivery, Envelope, RawDelivery};
use crate::metrics::PubSubMetricsCollector;
use crate::registry::SharedRegistry;
use crate::transport::Transport;

/// Peer name passed to callbacks for pub/sub deliveries
pub const PUBSUB_PEER: &str = "pubsub";

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOutcome {
    /// Callbacks that returned `Ok`
    pub delivered: usize,
    /// Callbacks that returned an error or panicked
    pub failed: usize,
    /// Envelope could not be decoded; nothing was invoked
    pub malformed: bool,
}

pub struct Dispatcher {
    registry: SharedRegistry,
    transport: Arc<dyn Transport>,
    metrics: PubSubMetricsCollector,
}

impl Dispatcher {
    pub fn new(
        registry: SharedRegistry,
        transport: Arc<dyn Transport>,
        metrics: PubSubMetricsCollector,
    ) -> Self {
        Self {
            registry,
            transport,
            metrics,
        }
    }

    /// Deliver one raw message to its queue's callbacks
    pub async fn dispatch(&self, raw: RawDelivery) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if !is_well_formed(&raw.routing_key) {
            warn!(routing_key = %raw.routing_key, "Routing key has no pubsub prefix");
        }
        let topic = decode(&raw.routing_key);

        let envelope = match Envelope::from_bytes(&raw.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.record_malformed();
                error!(routing_key = %raw.routing_key, queue = %raw.queue, "{}", e);
                outcome.malformed = true;
                return outcome;
            }
        };

        let Some((_, callbacks)) = self.registry.with(|reg| reg.callbacks_for(&raw.queue)) else {
            debug!(queue = %raw.queue, "Dropping delivery for unsubscribed queue");
            return outcome;
        };

        let delivery = Delivery {
            peer: PUBSUB_PEER.to_string(),
            sender: envelope.sender,
            bus: envelope.bus,
            topic,
            headers: envelope.headers,
            message: envelope.message,
        };

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback.on_message(&delivery))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    self.metrics.record_callback_failure();
                    error!(routing_key = %raw.routing_key, "Subscriber callback failed: {}", e);
                }
                Err(_) => {
                    outcome.failed += 1;
                    self.metrics.record_callback_failure();
                    error!(routing_key = %raw.routing_key, "Subscriber callback panicked");
                }
            }
            tokio::task::yield_now().await;
        }
        drop(callbacks);

        if outcome.delivered > 0 {
            self.metrics.record_delivery();
        }

        self.prune(&raw).await;
        outcome
    }

    /// Drop callbacks whose owners are gone; delete the queue once empty
    async fn prune(&self, raw: &RawDelivery) {
        if !self.registry.with(|reg| reg.prune(&raw.queue)) {
            return;
        }
        debug!(queue = %raw.queue, "All subscribers dropped, deleting queue");
        if let Err(e) = self.transport.delete_queue(&raw.queue).await {
            warn!(queue = %raw.queue, "Failed to delete abandoned queue: {}", e);
        }
    }

    /// Spawn the dispatch loop
    pub fn run(self: Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<RawDelivery>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(raw) = deliveries.recv().await {
                self.dispatch(raw).await;
            }
            debug!("Delivery channel closed, dispatch loop exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::memory::MemoryExchange;
    use crate::registry::{Callback, CallbackResult};
    use crate::types::{QueueName, QueueOptions, RoutingKey, Scope, Topic};
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Callback, Arc<Mutex<Vec<Delivery>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: Callback = Arc::new(move |d: &Delivery| -> CallbackResult {
            sink.lock().unwrap().push(d.clone());
            Ok(())
        });
        (cb, seen)
    }

    fn raw(queue: &str, key: &RoutingKey, body: Vec<u8>) -> RawDelivery {
        RawDelivery {
            queue: QueueName::new(queue),
            routing_key: key.clone(),
            body,
            properties: None,
        }
    }

    fn body(message: serde_json::Value) -> Vec<u8> {
        Envelope::outbound("sensor", "", None, message)
            .to_bytes()
            .unwrap()
    }

    fn dispatcher(registry: &SharedRegistry) -> Dispatcher {
        let exchange = MemoryExchange::new();
        Dispatcher::new(
            registry.clone(),
            exchange.connect("v1"),
            PubSubMetricsCollector::with_defaults(),
        )
    }

    #[tokio::test]
    async fn test_callback_sees_decoded_topic() {
        let registry = SharedRegistry::new();
        let (cb, seen) = recorder();
        let binding = encode(&Topic::from("devices"), Scope::Local, "v1");
        registry
            .with(|reg| reg.add(&binding, &QueueName::new("q"), QueueOptions::ephemeral(), "", &cb))
            .unwrap();

        let key = encode(&Topic::from("devices/room1/temp"), Scope::Local, "v1");
        let outcome = dispatcher(&registry)
            .dispatch(raw("q", &key, body(json!(72.5))))
            .await;
        assert_eq!(outcome.delivered, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].topic.as_str(), "devices/room1/temp");
        assert_eq!(seen[0].message, json!(72.5));
        assert_eq!(seen[0].sender, "sensor");
        assert_eq!(seen[0].peer, "pubsub");
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_isolated() {
        let registry = SharedRegistry::new();
        let failing: Callback =
            Arc::new(|_: &Delivery| -> CallbackResult { Err("handler exploded".into()) });
        let panicking: Callback = Arc::new(|_: &Delivery| -> CallbackResult { panic!("boom") });
        let (good, seen) = recorder();
        let key = encode(&Topic::from("a"), Scope::Local, "v1");
        registry.with(|reg| {
            for cb in [&failing, &panicking, &good] {
                reg.add(&key, &QueueName::new("q"), QueueOptions::ephemeral(), "", cb)
                    .unwrap();
            }
        });

        let outcome = dispatcher(&registry)
            .dispatch(raw("q", &key, body(json!(1))))
            .await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_envelope_dropped() {
        let registry = SharedRegistry::new();
        let (cb, seen) = recorder();
        let key = encode(&Topic::from("a"), Scope::Local, "v1");
        registry
            .with(|reg| reg.add(&key, &QueueName::new("q"), QueueOptions::ephemeral(), "", &cb))
            .unwrap();

        let outcome = dispatcher(&registry)
            .dispatch(raw("q", &key, br#"{"message": 1}"#.to_vec()))
            .await;
        assert!(outcome.malformed);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_callback_prunes_queue() {
        let registry = SharedRegistry::new();
        let (cb, _) = recorder();
        let key = encode(&Topic::from("a"), Scope::Local, "v1");
        registry
            .with(|reg| reg.add(&key, &QueueName::new("q"), QueueOptions::ephemeral(), "", &cb))
            .unwrap();
        drop(cb);

        let outcome = dispatcher(&registry)
            .dispatch(raw("q", &key, body(json!(1))))
            .await;
        assert_eq!(outcome.delivered, 0);
        assert!(registry.with(|reg| reg.is_empty()));
    }

    #[tokio::test]
    async fn test_unknown_queue_ignored() {
        let registry = SharedRegistry::new();
        let key = encode(&Topic::from("a"), Scope::Local, "v1");
        let outcome = dispatcher(&registry)
            .dispatch(raw("nobody", &key, body(json!(1))))
            .await;
        assert_eq!(outcome, DispatchOutcome::default());
    }
}
