//! Redis-backed topic exchange
//!
//! Emulates a broker topic exchange on plain Redis data structures:
//!
//! | key                              | type | contents                        |
//! |----------------------------------|------|---------------------------------|
//! | `<prefix>:queues`                | hash | queue name → declared options   |
//! | `<prefix>:bindings:<queue>`      | set  | routing key patterns            |
//! | `<prefix>:queue:<queue>`         | list | pending messages (LPUSH/BRPOP)  |
//! | `<prefix>:lease:<queue>`         | str  | liveness of auto-delete queues  |
//!
//! Publishing reads every binding, matches it with [`key_matches`] and pushes
//! the message onto each matching queue in one atomic pipeline. Each consumed
//! queue gets a task blocking on `BRPOP` over its own connection, outside the
//! shared pool. A health-check task pings the server, turns outages into
//! `Disconnected`/`Connected` events and deletes auto-delete queues whose
//! lease has expired.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::key_matches;
use crate::envelope::{PublishProperties, RawDelivery};
use crate::error::{TransportError, TransportResult};
use crate::transport::{DeliverySink, PublishOutcome, Transport, TransportEvent};
use crate::types::{QueueName, QueueOptions, RoutingKey};

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of pooled connections. Consumers use dedicated
    /// connections and do not count against it.
    pub pool_size: usize,
    /// Connection timeout in seconds. Also bounds how long a command waits
    /// for a free pooled connection.
    pub connect_timeout_secs: u64,
    /// Blocking pop timeout in seconds
    pub command_timeout_secs: u64,
    /// Namespace for every key written by the exchange
    pub key_prefix: String,
    /// Interval between health-check pings in seconds
    pub health_check_interval_secs: u64,
    /// How long an auto-delete queue survives without a live consumer
    pub queue_lease_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            connect_timeout_secs: 5,
            command_timeout_secs: 3,
            key_prefix: "agentbus".to_string(),
            health_check_interval_secs: 5,
            queue_lease_secs: 30,
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Set blocking pop timeout
    pub fn with_command_timeout(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    /// Set the key namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the health-check interval
    pub fn with_health_check_interval(mut self, secs: u64) -> Self {
        self.health_check_interval_secs = secs;
        self
    }

    /// Set the auto-delete queue lease
    pub fn with_queue_lease(mut self, secs: u64) -> Self {
        self.queue_lease_secs = secs;
        self
    }

    fn poll_secs(&self) -> u64 {
        self.command_timeout_secs.max(1)
    }

    /// Lease actually applied: never shorter than two blocking pops, which
    /// is how often a consumer refreshes it.
    pub fn effective_lease_secs(&self) -> u64 {
        self.queue_lease_secs.max(self.poll_secs() * 2)
    }
}

/// Key layout under one prefix
#[derive(Debug, Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn bindings(&self, queue: &QueueName) -> String {
        format!("{}:bindings:{}", self.prefix, queue)
    }

    fn list(&self, queue: &QueueName) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn lease(&self, queue: &QueueName) -> String {
        format!("{}:lease:{}", self.prefix, queue)
    }

    /// Append the commands deleting `queue` to `pipe`
    fn delete_into(&self, pipe: &mut redis::Pipeline, queue: &QueueName) {
        pipe.hdel(self.queues(), queue.as_str())
            .ignore()
            .del(self.bindings(queue))
            .ignore()
            .del(self.list(queue))
            .ignore()
            .del(self.lease(queue))
            .ignore();
    }
}

/// A message as stored in a queue list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    properties: PublishProperties,
}

impl StoredMessage {
    fn into_delivery(self, queue: QueueName) -> RawDelivery {
        RawDelivery {
            queue,
            routing_key: RoutingKey::new(self.routing_key),
            body: self.body,
            properties: Some(self.properties),
        }
    }
}

/// Compact encoding of queue options stored in the queues hash
fn options_tag(options: QueueOptions) -> String {
    let flag = |on: bool| if on { '1' } else { '0' };
    [
        flag(options.durable),
        flag(options.exclusive),
        flag(options.auto_delete),
    ]
    .iter()
    .collect()
}

fn tag_auto_delete(tag: &str) -> bool {
    tag.as_bytes().get(2) == Some(&b'1')
}

/// Auto-delete queues whose lease key no longer exists
fn abandoned_queues(candidates: Vec<QueueName>, alive: Vec<bool>) -> Vec<QueueName> {
    candidates
        .into_iter()
        .zip(alive)
        .filter(|(_, alive)| !alive)
        .map(|(queue, _)| queue)
        .collect()
}

const CONSUMER_RETRY_MIN: Duration = Duration::from_millis(100);
const CONSUMER_RETRY_MAX: Duration = Duration::from_secs(5);

/// Redis-backed transport for one agent connection
pub struct RedisTransport {
    pool: deadpool_redis::Pool,
    client: redis::Client,
    config: RedisConfig,
    keys: KeySpace,
    instance_name: String,
    connected: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    consumers: Mutex<HashMap<QueueName, JoinHandle<()>>>,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl RedisTransport {
    /// Connect with default configuration
    pub async fn connect(
        instance_name: impl Into<String>,
        url: impl Into<String>,
    ) -> TransportResult<Arc<Self>> {
        Self::with_config(instance_name, RedisConfig::new(url)).await
    }

    /// Connect with custom configuration
    pub async fn with_config(
        instance_name: impl Into<String>,
        config: RedisConfig,
    ) -> TransportResult<Arc<Self>> {
        let mut pool_config = deadpool_redis::Config::from_url(&config.url);
        let mut pool = deadpool_redis::PoolConfig::new(config.pool_size);
        pool.timeouts.wait = Some(Duration::from_secs(config.connect_timeout_secs));
        pool.timeouts.create = Some(Duration::from_secs(config.connect_timeout_secs));
        pool_config.pool = Some(pool);

        let pool = pool_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let client = redis::Client::open(config.url.as_str())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(TransportEvent::Connecting);

        // Test connection
        tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            ping(&pool),
        )
        .await
        .map_err(|_| TransportError::NotConnected)??;

        info!("Redis exchange connected to {}", config.url);
        let _ = events_tx.send(TransportEvent::Connected);

        let keys = KeySpace {
            prefix: config.key_prefix.clone(),
        };
        let transport = Arc::new(Self {
            pool,
            client,
            config,
            keys,
            instance_name: instance_name.into(),
            connected: Arc::new(AtomicBool::new(true)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            consumers: Mutex::new(HashMap::new()),
            health: Mutex::new(None),
        });

        let health = transport.spawn_health_check();
        *lock(&transport.health) = Some(health);
        Ok(transport)
    }

    /// Get a connection from the pool
    async fn get_connection(&self) -> TransportResult<deadpool_redis::Connection> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.pool.get().await.map_err(|e| {
            warn!("Redis pool unavailable: {}", e);
            TransportError::NotConnected
        })
    }

    /// Options tag of a declared queue
    async fn queue_tag(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &QueueName,
    ) -> TransportResult<String> {
        let tag: Option<String> = conn.hget(self.keys.queues(), queue.as_str()).await?;
        tag.ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))
    }

    /// Delete auto-delete queues whose consumer stopped refreshing the
    /// lease, e.g. because its agent crashed. Returns the deleted queues.
    pub async fn sweep_abandoned_queues(&self) -> TransportResult<Vec<QueueName>> {
        sweep_abandoned_queues(&self.pool, &self.keys).await
    }

    fn stop_consumer(&self, queue: &QueueName) {
        if let Some(handle) = lock(&self.consumers).remove(queue) {
            handle.abort();
        }
    }

    fn spawn_health_check(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let keys = self.keys.clone();
        let connected = Arc::clone(&self.connected);
        let events = self.events_tx.clone();
        let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;
                let result = tokio::time::timeout(period, ping(&pool)).await;
                let alive = matches!(result, Ok(Ok(())));
                let was_connected = connected.load(Ordering::SeqCst);

                if was_connected && !alive {
                    connected.store(false, Ordering::SeqCst);
                    let reason = match result {
                        Ok(Err(e)) => e.to_string(),
                        _ => "health check timed out".to_string(),
                    };
                    warn!("Redis exchange unreachable: {}", reason);
                    if events.send(TransportEvent::Disconnected { reason }).is_err() {
                        break;
                    }
                } else if !was_connected && alive {
                    info!("Redis exchange reachable again");
                    let _ = events.send(TransportEvent::Connecting);
                    connected.store(true, Ordering::SeqCst);
                    if events.send(TransportEvent::Connected).is_err() {
                        break;
                    }
                }

                // Skipped on the tick that reconnects, before leases are renewed
                if was_connected && alive {
                    match sweep_abandoned_queues(&pool, &keys).await {
                        Ok(swept) if !swept.is_empty() => {
                            info!(queues = swept.len(), "Deleted abandoned auto-delete queues");
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Queue sweep skipped: {}", e),
                    }
                }
            }
        })
    }

    fn spawn_consumer(
        &self,
        queue: QueueName,
        auto_delete: bool,
        sink: DeliverySink,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let poll = self.config.poll_secs();
        let connection_config = redis::AsyncConnectionConfig::new()
            .set_connection_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .set_response_timeout(Duration::from_secs(poll + self.config.connect_timeout_secs));
        let list_key = self.keys.list(&queue);
        let lease = auto_delete
            .then(|| (self.keys.lease(&queue), self.config.effective_lease_secs()));

        tokio::spawn(async move {
            let mut conn: Option<redis::aio::MultiplexedConnection> = None;
            let mut backoff = CONSUMER_RETRY_MIN;

            while !sink.is_closed() {
                if conn.is_none() {
                    match client
                        .get_multiplexed_async_connection_with_config(&connection_config)
                        .await
                    {
                        Ok(fresh) => conn = Some(fresh),
                        Err(e) => {
                            warn!(
                                queue = %queue,
                                "Consumer connection failed, retrying in {:?}: {}", backoff, e
                            );
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(CONSUMER_RETRY_MAX);
                            continue;
                        }
                    }
                }
                let Some(active) = conn.as_mut() else {
                    continue;
                };

                let popped = pop_next(active, &list_key, lease.as_ref(), poll).await;
                let json = match popped {
                    Ok(Some(json)) => json,
                    Ok(None) => {
                        backoff = CONSUMER_RETRY_MIN;
                        continue;
                    }
                    Err(e) => {
                        warn!(queue = %queue, "Consumer error, retrying in {:?}: {}", backoff, e);
                        conn = None;
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(CONSUMER_RETRY_MAX);
                        continue;
                    }
                };
                backoff = CONSUMER_RETRY_MIN;

                match serde_json::from_str::<StoredMessage>(&json) {
                    Ok(stored) => {
                        if sink.send(stored.into_delivery(queue.clone())).is_err() {
                            // Put it back for the next consumer
                            let _ = active.rpush::<_, _, ()>(&list_key, json).await;
                            break;
                        }
                    }
                    Err(e) => error!(queue = %queue, "Dropping undecodable message: {}", e),
                }
            }
            debug!(queue = %queue, "Consumer task exiting");
        })
    }
}

/// Refresh the queue lease, if any, then wait up to `poll` seconds for
/// one message
async fn pop_next(
    conn: &mut redis::aio::MultiplexedConnection,
    list_key: &str,
    lease: Option<&(String, u64)>,
    poll: u64,
) -> redis::RedisResult<Option<String>> {
    if let Some((lease_key, secs)) = lease {
        conn.set_ex::<_, _, ()>(lease_key, 1, *secs).await?;
    }
    let popped: Option<(String, String)> = conn.brpop(list_key, poll as f64).await?;
    Ok(popped.map(|(_, json)| json))
}

async fn sweep_abandoned_queues(
    pool: &deadpool_redis::Pool,
    keys: &KeySpace,
) -> TransportResult<Vec<QueueName>> {
    let mut conn = pool.get().await.map_err(|_| TransportError::NotConnected)?;
    let declared: HashMap<String, String> = conn.hgetall(keys.queues()).await?;
    let candidates: Vec<QueueName> = declared
        .into_iter()
        .filter(|(_, tag)| tag_auto_delete(tag))
        .map(|(queue, _)| QueueName::new(queue))
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut check = redis::pipe();
    for queue in &candidates {
        check.exists(keys.lease(queue));
    }
    let alive: Vec<bool> = check.query_async(&mut conn).await?;

    let abandoned = abandoned_queues(candidates, alive);
    if !abandoned.is_empty() {
        let mut delete = redis::pipe();
        delete.atomic();
        for queue in &abandoned {
            keys.delete_into(&mut delete, queue);
        }
        delete.query_async::<()>(&mut conn).await?;
    }
    Ok(abandoned)
}

async fn ping(pool: &deadpool_redis::Pool) -> TransportResult<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|_| TransportError::NotConnected)?;
    redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .map(|_| ())
        .map_err(TransportError::from)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for RedisTransport {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn declare_queue(
        &self,
        queue: &QueueName,
        options: QueueOptions,
    ) -> TransportResult<()> {
        let mut conn = self.get_connection().await?;
        let tag = options_tag(options);
        let lease_secs = self.config.effective_lease_secs();

        // Queue and lease appear together so a sweep never sees one alone
        let mut declare = redis::pipe();
        declare.atomic().hset_nx(self.keys.queues(), queue.as_str(), &tag);
        if options.auto_delete {
            declare.set_ex(self.keys.lease(queue), 1, lease_secs).ignore();
        }
        let replies: Vec<bool> = declare.query_async(&mut conn).await?;
        if replies.first().copied().unwrap_or(false) {
            debug!(queue = %queue, "Declared queue");
            return Ok(());
        }

        let existing: Option<String> = conn.hget(self.keys.queues(), queue.as_str()).await?;
        match existing {
            Some(existing) if existing != tag => Err(TransportError::DeclareRejected {
                queue: queue.to_string(),
                reason: format!("inequivalent arguments: declared {}, requested {}", existing, tag),
            }),
            Some(_) => Ok(()),
            // Swept between the two commands
            None => Err(TransportError::QueueNotFound(queue.to_string())),
        }
    }

    async fn bind(&self, queue: &QueueName, routing_key: &RoutingKey) -> TransportResult<()> {
        let mut conn = self.get_connection().await?;
        self.queue_tag(&mut conn, queue).await?;
        conn.sadd::<_, _, ()>(self.keys.bindings(queue), routing_key.as_str())
            .await?;
        Ok(())
    }

    async fn unbind(&self, queue: &QueueName, routing_key: &RoutingKey) -> TransportResult<()> {
        let mut conn = self.get_connection().await?;
        conn.srem::<_, _, ()>(self.keys.bindings(queue), routing_key.as_str())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &QueueName) -> TransportResult<()> {
        self.stop_consumer(queue);
        let mut conn = self.get_connection().await?;
        let mut delete = redis::pipe();
        delete.atomic();
        self.keys.delete_into(&mut delete, queue);
        delete.query_async::<()>(&mut conn).await?;
        debug!(queue = %queue, "Deleted queue");
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &RoutingKey,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> TransportResult<PublishOutcome> {
        let mut conn = self.get_connection().await?;

        let queues: Vec<String> = conn.hkeys(self.keys.queues()).await?;
        let mut lookup = redis::pipe();
        for queue in &queues {
            lookup.smembers(self.keys.bindings(&QueueName::new(queue.as_str())));
        }
        let bindings: Vec<Vec<String>> = if queues.is_empty() {
            Vec::new()
        } else {
            lookup.query_async(&mut conn).await?
        };

        let targets: Vec<QueueName> = queues
            .iter()
            .zip(bindings)
            .filter(|(_, keys)| {
                keys.iter()
                    .any(|k| key_matches(&RoutingKey::new(k.as_str()), routing_key))
            })
            .map(|(queue, _)| QueueName::new(queue.as_str()))
            .collect();

        if !targets.is_empty() {
            let stored = StoredMessage {
                routing_key: routing_key.to_string(),
                body,
                properties: properties.clone(),
            };
            let json = serde_json::to_string(&stored)
                .map_err(|e| TransportError::PublishRejected(e.to_string()))?;

            let mut push = redis::pipe();
            push.atomic();
            for queue in &targets {
                push.lpush(self.keys.list(queue), &json).ignore();
            }
            push.query_async::<()>(&mut conn).await?;
        }

        debug!(routing_key = %routing_key, routed_to = targets.len(), "Redis exchange routed message");
        Ok(PublishOutcome::Enqueued)
    }

    async fn consume(&self, queue: &QueueName, sink: DeliverySink) -> TransportResult<()> {
        let auto_delete = {
            let mut conn = self.get_connection().await?;
            tag_auto_delete(&self.queue_tag(&mut conn, queue).await?)
        };

        let handle = self.spawn_consumer(queue.clone(), auto_delete, sink);
        if let Some(previous) = lock(&self.consumers).insert(queue.clone(), handle) {
            previous.abort();
        }
        Ok(())
    }

    fn events(&self) -> TransportResult<mpsc::UnboundedReceiver<TransportEvent>> {
        lock(&self.events_rx)
            .take()
            .ok_or_else(|| TransportError::Backend("event stream already taken".to_string()))
    }

    fn supports_confirms(&self) -> bool {
        false
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        if let Some(health) = lock(&self.health).take() {
            health.abort();
        }
        for (_, consumer) in lock(&self.consumers).drain() {
            consumer.abort();
        }
    }
}
