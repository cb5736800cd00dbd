//! In-process topic exchange
//!
//! [`MemoryExchange`] behaves like a broker's topic exchange: queues with
//! durability/auto-delete attributes, routing-key bindings, a backlog for
//! queues without a consumer and optional publisher confirms. Each
//! [`MemoryTransport`] is one agent connection to it and can be disconnected
//! and reconnected to exercise the lifecycle controller. Fault injection for
//! binds and publishes lets tests drive partial-failure paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::key_matches;
use crate::envelope::{PublishProperties, RawDelivery};
use crate::error::{TransportError, TransportResult};
use crate::transport::{DeliverySink, PublishOutcome, Transport, TransportEvent};
use crate::types::{QueueName, QueueOptions, RoutingKey};

/// A message as it was handed to the exchange
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub routing_key: RoutingKey,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
    /// Number of queues the message was routed to
    pub routed_to: usize,
}

struct QueueState {
    options: QueueOptions,
    bindings: HashSet<RoutingKey>,
    backlog: VecDeque<RawDelivery>,
    consumer: Option<(u64, DeliverySink)>,
}

impl QueueState {
    fn push(&mut self, delivery: RawDelivery) {
        let Some((_, sink)) = &self.consumer else {
            self.backlog.push_back(delivery);
            return;
        };
        if let Err(mpsc::error::SendError(returned)) = sink.send(delivery) {
            self.consumer = None;
            self.backlog.push_back(returned);
        }
    }
}

#[derive(Default)]
struct ExchangeState {
    queues: HashMap<QueueName, QueueState>,
    published: Vec<PublishedRecord>,
}

/// Shared in-process exchange
#[derive(Default)]
pub struct MemoryExchange {
    state: Mutex<ExchangeState>,
    next_connection: AtomicU64,
}

impl MemoryExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a connection without publisher confirms
    pub fn connect(self: &Arc<Self>, instance_name: impl Into<String>) -> Arc<MemoryTransport> {
        self.open(instance_name.into(), false)
    }

    /// Open a connection with publisher confirms enabled
    pub fn connect_with_confirms(
        self: &Arc<Self>,
        instance_name: impl Into<String>,
    ) -> Arc<MemoryTransport> {
        self.open(instance_name.into(), true)
    }

    fn open(self: &Arc<Self>, instance_name: String, confirms: bool) -> Arc<MemoryTransport> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(MemoryTransport {
            exchange: Arc::clone(self),
            id,
            instance_name,
            confirms,
            connected: AtomicBool::new(true),
            next_tag: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            faults: Mutex::new(Faults::default()),
        });
        transport.emit(TransportEvent::Connecting);
        transport.emit(TransportEvent::Connected);
        debug!(connection = id, "Memory transport connected");
        transport
    }

    /// Whether a queue currently exists
    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// All queue names, sorted
    pub fn queues(&self) -> Vec<QueueName> {
        let mut names: Vec<_> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared options of a queue
    pub fn queue_options(&self, queue: &QueueName) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options)
    }

    /// Binding keys of a queue, sorted
    pub fn bindings(&self, queue: &QueueName) -> Vec<RoutingKey> {
        let state = self.lock();
        let mut keys: Vec<_> = state
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Total number of (queue, key) bindings across the exchange
    pub fn binding_count(&self) -> usize {
        self.lock().queues.values().map(|q| q.bindings.len()).sum()
    }

    /// Queues bound to exactly `routing_key`
    pub fn queues_bound_to(&self, routing_key: &RoutingKey) -> Vec<QueueName> {
        let state = self.lock();
        let mut names: Vec<_> = state
            .queues
            .iter()
            .filter(|(_, q)| q.bindings.contains(routing_key))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Messages waiting in a queue without a consumer
    pub fn backlog_len(&self, queue: &QueueName) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Every message handed to the exchange, in order
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.lock().published.clone()
    }

    /// Messages published under exactly `routing_key`
    pub fn published_to(&self, routing_key: &RoutingKey) -> Vec<PublishedRecord> {
        self.lock()
            .published
            .iter()
            .filter(|r| &r.routing_key == routing_key)
            .cloned()
            .collect()
    }

    fn drop_connection(&self, connection: u64) -> Vec<QueueName> {
        let mut state = self.lock();
        let mut deleted = Vec::new();
        state.queues.retain(|name, queue| {
            let owned = matches!(queue.consumer, Some((id, _)) if id == connection);
            if !owned {
                return true;
            }
            if queue.options.auto_delete || queue.options.exclusive {
                deleted.push(name.clone());
                return false;
            }
            queue.consumer = None;
            true
        });
        deleted
    }
}

#[derive(Default)]
struct Faults {
    fail_all_binds: bool,
    failing_binds: HashSet<RoutingKey>,
    fail_publishes: bool,
    failing_publishes: Vec<RoutingKey>,
}

/// One connection to a [`MemoryExchange`]
pub struct MemoryTransport {
    exchange: Arc<MemoryExchange>,
    id: u64,
    instance_name: String,
    confirms: bool,
    connected: AtomicBool,
    next_tag: AtomicU64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    faults: Mutex<Faults>,
}

impl MemoryTransport {
    pub fn exchange(&self) -> &Arc<MemoryExchange> {
        &self.exchange
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the connection. Consumers owned by it are cancelled and
    /// auto-delete queues they held are destroyed.
    pub fn disconnect(&self, reason: impl Into<String>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let deleted = self.exchange.drop_connection(self.id);
        let reason = reason.into();
        info!(
            connection = self.id,
            deleted_queues = deleted.len(),
            "Memory transport disconnected: {}",
            reason
        );
        self.emit(TransportEvent::Disconnected { reason });
    }

    /// Re-establish a dropped connection
    pub fn reconnect(&self) {
        if self.connected.load(Ordering::SeqCst) {
            return;
        }
        self.emit(TransportEvent::Connecting);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Connected);
    }

    /// Make every bind fail until cleared
    pub fn fail_all_binds(&self, fail: bool) {
        self.faults().fail_all_binds = fail;
    }

    /// Make binds for one routing key fail until cleared
    pub fn fail_binds_for(&self, routing_key: RoutingKey) {
        self.faults().failing_binds.insert(routing_key);
    }

    /// Make every publish fail until cleared
    pub fn fail_publishes(&self, fail: bool) {
        self.faults().fail_publishes = fail;
    }

    /// Make publishes whose routing key matches `pattern` fail until cleared
    pub fn fail_publishes_matching(&self, pattern: RoutingKey) {
        self.faults().failing_publishes.push(pattern);
    }

    pub fn clear_faults(&self) {
        *self.faults() = Faults::default();
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.events_tx.send(event);
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn declare_queue(
        &self,
        queue: &QueueName,
        options: QueueOptions,
    ) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut state = self.exchange.lock();
        match state.queues.get(queue) {
            Some(existing) if existing.options != options => {
                Err(TransportError::DeclareRejected {
                    queue: queue.to_string(),
                    reason: format!(
                        "inequivalent arguments: declared {:?}, requested {:?}",
                        existing.options, options
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.clone(),
                    QueueState {
                        options,
                        bindings: HashSet::new(),
                        backlog: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(&self, queue: &QueueName, routing_key: &RoutingKey) -> TransportResult<()> {
        self.ensure_connected()?;
        {
            let faults = self.faults();
            if faults.fail_all_binds || faults.failing_binds.contains(routing_key) {
                return Err(TransportError::DeclareRejected {
                    queue: queue.to_string(),
                    reason: format!("bind to '{}' refused", routing_key),
                });
            }
        }

        let mut state = self.exchange.lock();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        entry.bindings.insert(routing_key.clone());
        Ok(())
    }

    async fn unbind(&self, queue: &QueueName, routing_key: &RoutingKey) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut state = self.exchange.lock();
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.bindings.remove(routing_key);
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &QueueName) -> TransportResult<()> {
        self.ensure_connected()?;
        self.exchange.lock().queues.remove(queue);
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &RoutingKey,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> TransportResult<PublishOutcome> {
        self.ensure_connected()?;
        let refused = {
            let faults = self.faults();
            faults.fail_publishes
                || faults
                    .failing_publishes
                    .iter()
                    .any(|pattern| key_matches(pattern, routing_key))
        };
        if refused {
            return Err(TransportError::PublishRejected(format!(
                "publish to '{}' refused",
                routing_key
            )));
        }

        let routed_to = {
            let mut state = self.exchange.lock();
            let mut routed_to = 0;
            for (name, queue) in state.queues.iter_mut() {
                if queue.bindings.iter().any(|b| key_matches(b, routing_key)) {
                    queue.push(RawDelivery {
                        queue: name.clone(),
                        routing_key: routing_key.clone(),
                        body: body.clone(),
                        properties: Some(properties.clone()),
                    });
                    routed_to += 1;
                }
            }
            state.published.push(PublishedRecord {
                routing_key: routing_key.clone(),
                body,
                properties: properties.clone(),
                routed_to,
            });
            routed_to
        };
        debug!(routing_key = %routing_key, routed_to, "Memory exchange routed message");

        if !self.confirms {
            return Ok(PublishOutcome::Enqueued);
        }

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.emit(TransportEvent::Confirmed {
            message_id: properties.message_id.clone(),
            delivery_tag,
        });
        Ok(PublishOutcome::Pending { delivery_tag })
    }

    async fn consume(&self, queue: &QueueName, sink: DeliverySink) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut state = self.exchange.lock();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;

        while let Some(delivery) = entry.backlog.pop_front() {
            if let Err(mpsc::error::SendError(returned)) = sink.send(delivery) {
                entry.backlog.push_front(returned);
                return Err(TransportError::Backend("delivery sink closed".to_string()));
            }
        }
        entry.consumer = Some((self.id, sink));
        Ok(())
    }

    fn events(&self) -> TransportResult<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Backend("event stream already taken".to_string()))
    }

    fn supports_confirms(&self) -> bool {
        self.confirms
    }
}
