//! The per-connection pub/sub handle
//!
//! [`PubSub`] ties the registry, pending table, lifecycle controller,
//! publisher, dispatcher and bridge of one agent connection together and
//! owns the background tasks driving them.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentbus_pubsub::{
//!     AgentId, AgentIdentity, Callback, CallbackResult, Delivery, MemoryExchange, Publish,
//!     PubSub, PubSubConfig, Subscribe, Topic,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exchange = MemoryExchange::new();
//! let identity = AgentIdentity::new(AgentId::parse("listener")?, "volttron1");
//! let pubsub = PubSub::start(identity, exchange.connect("volttron1"), PubSubConfig::default())?;
//!
//! let on_temp: Callback = Arc::new(|d: &Delivery| -> CallbackResult {
//!     println!("{} = {}", d.topic, d.message);
//!     Ok(())
//! });
//! pubsub.subscribe(Subscribe::new(Topic::parse("devices")?, on_temp.clone())).await?;
//!
//! pubsub
//!     .publish(Publish::new(Topic::parse("devices/room1/temp")?, json!(72.5)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeRequest, BridgeStatus};
use crate::codec::{PUBSUB_NAMESPACE, decode, encode, ephemeral_queue_name};
use crate::config::PubSubConfig;
use crate::dispatcher::{Dispatcher, PUBSUB_PEER};
use crate::envelope::Headers;
use crate::error::{PubSubError, PubSubResult};
use crate::lifecycle::{ConnectionController, ConnectionState, SyncReport};
use crate::metrics::{PubSubMetrics, PubSubMetricsCollector};
use crate::pending::{Ack, PendingResults, PublishResult};
use crate::publisher::Publisher;
use crate::registry::{Callback, SharedRegistry, SubscriptionRecord};
use crate::transport::Transport;
use crate::types::{AgentIdentity, QueueName, QueueOptions, RoutingKey, Scope, Topic};

/// Subscribe request
#[derive(Clone)]
pub struct Subscribe {
    pub peer: String,
    pub prefix: Topic,
    pub callback: Callback,
    pub bus: String,
    pub all_platforms: bool,
    /// Named durable queue; `None` uses a generated ephemeral queue
    pub persistent_queue: Option<QueueName>,
}

impl Subscribe {
    pub fn new(prefix: Topic, callback: Callback) -> Self {
        Self {
            peer: PUBSUB_PEER.to_string(),
            prefix,
            callback,
            bus: String::new(),
            all_platforms: false,
            persistent_queue: None,
        }
    }

    #[must_use]
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    #[must_use]
    pub fn bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = bus.into();
        self
    }

    #[must_use]
    pub fn all_platforms(mut self, all_platforms: bool) -> Self {
        self.all_platforms = all_platforms;
        self
    }

    #[must_use]
    pub fn persistent_queue(mut self, queue: impl Into<String>) -> Self {
        self.persistent_queue = Some(QueueName::new(queue));
        self
    }
}

/// Unsubscribe request. Leaving both `prefix` and `callback` unset removes
/// nothing.
#[derive(Clone, Default)]
pub struct Unsubscribe {
    pub peer: String,
    pub prefix: Option<Topic>,
    pub callback: Option<Callback>,
    pub bus: String,
    pub all_platforms: bool,
}

impl Unsubscribe {
    pub fn new() -> Self {
        Self {
            peer: PUBSUB_PEER.to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    #[must_use]
    pub fn prefix(mut self, prefix: Topic) -> Self {
        self.prefix = Some(prefix);
        self
    }

    #[must_use]
    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = bus.into();
        self
    }

    #[must_use]
    pub fn all_platforms(mut self, all_platforms: bool) -> Self {
        self.all_platforms = all_platforms;
        self
    }
}

/// Publish request
#[derive(Debug, Clone)]
pub struct Publish {
    pub peer: String,
    pub topic: Topic,
    pub headers: Option<Headers>,
    pub message: Value,
    pub bus: String,
    pub all_platforms: bool,
}

impl Publish {
    pub fn new(topic: Topic, message: Value) -> Self {
        Self {
            peer: PUBSUB_PEER.to_string(),
            topic,
            headers: None,
            message,
            bus: String::new(),
            all_platforms: false,
        }
    }

    #[must_use]
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    #[must_use]
    pub fn bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = bus.into();
        self
    }

    #[must_use]
    pub fn all_platforms(mut self, all_platforms: bool) -> Self {
        self.all_platforms = all_platforms;
        self
    }
}

/// Result of a subscribe call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub routing_key: RoutingKey,
    pub queue: QueueName,
    /// Whether the queue is bound on the transport right now. `false` means
    /// the subscription is recorded and will be bound on the next
    /// synchronize.
    pub bound: bool,
    pub bridge: BridgeStatus,
}

/// One agent connection's pub/sub subsystem
pub struct PubSub {
    identity: AgentIdentity,
    config: PubSubConfig,
    transport: Arc<dyn Transport>,
    registry: SharedRegistry,
    pending: Arc<PendingResults>,
    controller: Arc<ConnectionController>,
    publisher: Publisher,
    bridge: Arc<Bridge>,
    metrics: PubSubMetricsCollector,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PubSub {
    /// Wire up the components for `transport` and spawn the lifecycle,
    /// dispatch and pending-cleanup tasks. Must be called inside a tokio
    /// runtime.
    pub fn start(
        identity: AgentIdentity,
        transport: Arc<dyn Transport>,
        config: PubSubConfig,
    ) -> PubSubResult<Self> {
        config.validate()?;
        if identity.instance_name != transport.instance_name() {
            return Err(PubSubError::InvalidConfig(format!(
                "identity belongs to instance '{}' but the transport is connected to '{}'",
                identity.instance_name,
                transport.instance_name()
            )));
        }
        let events = transport.events()?;

        let registry = SharedRegistry::new();
        let pending = PendingResults::new(config.max_pending);
        let metrics = PubSubMetricsCollector::new(config.metrics_max_topics);
        let (sink, deliveries) = mpsc::unbounded_channel();

        let controller = Arc::new(ConnectionController::new(
            Arc::clone(&transport),
            registry.clone(),
            Arc::clone(&pending),
            metrics.clone(),
            sink,
        ));
        let bridge = Arc::new(Bridge::new(
            Arc::clone(&transport),
            identity.clone(),
            metrics.clone(),
        ));
        let publisher = Publisher::new(
            Arc::clone(&transport),
            identity.clone(),
            Arc::clone(&pending),
            Arc::clone(&bridge),
            metrics.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            Arc::clone(&transport),
            metrics.clone(),
        ));

        let tasks = vec![
            Arc::clone(&controller).run(events),
            dispatcher.run(deliveries),
            Arc::clone(&pending).start_cleanup_task(config.cleanup_interval, config.pending_ttl),
        ];

        info!(
            identity = %identity.identity,
            instance = %identity.instance_name,
            "Pub/sub subsystem started"
        );

        Ok(Self {
            identity,
            config,
            transport,
            registry,
            pending,
            controller,
            publisher,
            bridge,
            metrics,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Wait until the transport is connected and subscriptions are
    /// synchronized
    pub async fn wait_connected(&self, timeout: Duration) -> PubSubResult<()> {
        self.controller.wait_connected(timeout).await
    }

    /// Subscribe `callback` to every topic starting with `prefix`.
    ///
    /// Repeated subscribes for the same prefix and bus share one generated
    /// queue. The subscription is recorded before anything is awaited, so a
    /// cancelled call still leaves it in the registry for the next
    /// synchronize. While disconnected it is only recorded; it is bound when
    /// the connection comes up.
    pub async fn subscribe(&self, request: Subscribe) -> PubSubResult<Subscription> {
        let scope = Scope::from_all_platforms(request.all_platforms);
        let routing_key = encode(&request.prefix, scope, &self.identity.instance_name);

        let (queue, options, is_new_queue) = self.registry.with(|reg| {
            let (queue, options, is_new_queue) = match &request.persistent_queue {
                Some(name) => (
                    name.clone(),
                    QueueOptions::persistent(),
                    reg.callbacks_for(name).is_none(),
                ),
                None => match reg.ephemeral_queue_for(&routing_key, &request.bus) {
                    Some(existing) => (existing, QueueOptions::ephemeral(), false),
                    None => (
                        ephemeral_queue_name(&self.identity.identity),
                        QueueOptions::ephemeral(),
                        true,
                    ),
                },
            };
            reg.add(&routing_key, &queue, options, &request.bus, &request.callback)
                .map(|_| (queue, options, is_new_queue))
        })?;

        debug!(
            peer = %request.peer,
            routing_key = %routing_key,
            queue = %queue,
            "Subscribing"
        );

        let bridge = if scope.is_all_platforms() {
            self.bridge
                .forward(BridgeRequest::Subscribe {
                    prefix: request.prefix.to_string(),
                    bus: request.bus.clone(),
                    all_platforms: true,
                })
                .await
        } else {
            BridgeStatus::NotRequired
        };

        let mut bound = !is_new_queue && self.controller.is_connected();
        if is_new_queue {
            if self.controller.is_connected() {
                let record = SubscriptionRecord {
                    routing_key: routing_key.clone(),
                    queue: queue.clone(),
                    options,
                    bus: request.bus.clone(),
                    callbacks: 1,
                };
                match self.controller.attach(&record).await {
                    Ok(()) => bound = true,
                    Err(e) => {
                        self.metrics.record_binding_failure();
                        warn!(routing_key = %routing_key, queue = %queue, "{}", e);
                    }
                }
            } else {
                debug!(
                    routing_key = %routing_key,
                    "Subscription will be bound when the transport connects"
                );
            }
        }

        Ok(Subscription {
            routing_key,
            queue,
            bound,
            bridge,
        })
    }

    /// Remove subscriptions and return the topics that were unsubscribed.
    ///
    /// Queues left without callbacks are deleted, or on the next
    /// synchronize if the transport is down. An unknown prefix/callback pair
    /// yields an empty list.
    pub async fn unsubscribe(&self, request: Unsubscribe) -> PubSubResult<Vec<Topic>> {
        let scope = Scope::from_all_platforms(request.all_platforms);
        let routing_key = request
            .prefix
            .as_ref()
            .map(|prefix| encode(prefix, scope, &self.identity.instance_name));

        let removal = match self
            .registry
            .with(|reg| reg.remove(routing_key.as_ref(), request.callback.as_ref()))
        {
            Ok(removal) => removal,
            Err(PubSubError::NoSuchSubscription(reason)) => {
                debug!(peer = %request.peer, "Nothing to unsubscribe: {}", reason);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        for queue in &removal.deleted_queues {
            self.controller.retire_queue(queue).await;
        }

        let topics: Vec<Topic> = removal.routing_keys.iter().map(decode).collect();

        if scope.is_all_platforms() {
            self.bridge
                .forward(BridgeRequest::Unsubscribe {
                    prefixes: topics.iter().map(Topic::to_string).collect(),
                    bus: request.bus.clone(),
                })
                .await;
        }

        debug!(peer = %request.peer, removed = topics.len(), "Unsubscribed");
        Ok(topics)
    }

    /// Publish a message. The returned future resolves on broker
    /// confirmation, or immediately for backends without confirms.
    pub async fn publish(&self, request: Publish) -> PubSubResult<PublishResult> {
        debug!(peer = %request.peer, topic = %request.topic, "Publishing");
        self.publisher
            .publish(
                &request.topic,
                request.headers,
                request.message,
                &request.bus,
                Scope::from_all_platforms(request.all_platforms),
            )
            .await
    }

    /// Publish and wait for the result within the configured default timeout
    pub async fn publish_and_wait(&self, request: Publish) -> PubSubResult<Ack> {
        self.publish(request)
            .await?
            .get(self.config.default_timeout)
            .await
    }

    /// `(bus, topic, is_subscriber)` for each subscribed topic starting with
    /// `prefix`, or with `reverse`, each subscribed topic that `prefix`
    /// starts with. Every entry is a local subscription, so `is_subscriber`
    /// is always `true`. A prefix subscribed both locally and on all
    /// platforms is listed once.
    pub fn list(
        &self,
        peer: &str,
        prefix: &str,
        bus: &str,
        subscribed: bool,
        reverse: bool,
    ) -> Vec<(String, Topic, bool)> {
        debug!(peer, prefix, subscribed, reverse, "Listing subscriptions");
        let entries = self.registry.with(|reg| reg.list(PUBSUB_NAMESPACE, false));

        let mut seen = HashSet::new();
        let mut results: Vec<(String, Topic, bool)> = entries
            .into_iter()
            .map(|(key, _)| decode(&key))
            .filter(|topic| seen.insert(topic.clone()))
            .filter(|topic| {
                if reverse {
                    prefix.starts_with(topic.as_str())
                } else {
                    topic.as_str().starts_with(prefix)
                }
            })
            .map(|topic| (bus.to_string(), topic, true))
            .collect();
        results.sort_by(|a, b| a.1.cmp(&b.1));
        results
    }

    /// Re-bind every subscription on the transport
    pub async fn synchronize(&self) -> PubSubResult<SyncReport> {
        self.controller.synchronize().await
    }

    pub fn metrics(&self) -> PubSubMetrics {
        self.metrics.snapshot()
    }

    /// Publish results still waiting for confirmation
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Publishes attempted on this connection
    pub fn message_count(&self) -> u64 {
        self.publisher.message_count()
    }

    /// Stop the subsystem: delete ephemeral queues, fail outstanding
    /// publishes with `ConnectionLost` and stop the background tasks.
    /// Durable queues are left on the broker.
    pub async fn shutdown(&self) {
        let records = self.registry.with(|reg| reg.clear());

        if self.controller.is_connected() {
            for record in records.iter().filter(|r| r.options.auto_delete) {
                if let Err(e) = self.transport.delete_queue(&record.queue).await {
                    warn!(queue = %record.queue, "Failed to delete queue on shutdown: {}", e);
                }
            }
        }

        let failed = self
            .pending
            .fail_all(PubSubError::ConnectionLost("pub/sub shut down".to_string()));

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        info!(
            identity = %self.identity.identity,
            subscriptions = records.len(),
            pending_failed = failed,
            "Pub/sub subsystem shut down"
        );
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
