//! Connection lifecycle
//!
//! Watches the transport's event stream. Entering `Connected` replays the
//! subscription registry against the transport; entering `Disconnected`
//! fails every outstanding publish. Publisher confirmations are routed into
//! the pending result table from here as well.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PubSubError, PubSubResult, TransportError};
use crate::metrics::PubSubMetricsCollector;
use crate::pending::{AckStatus, PendingResults};
use crate::registry::{SharedRegistry, SubscriptionRecord};
use crate::transport::{DeliverySink, Transport, TransportEvent};
use crate::types::QueueName;

/// Connection state as seen by the pub/sub core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Outcome of one synchronize pass
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Registry entries considered
    pub total: usize,
    /// Entries declared, bound and consuming
    pub bound: usize,
    /// One `BindingFailure` per entry that could not be restored
    pub failures: Vec<PubSubError>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Keeps the transport in line with the registry across reconnects
pub struct ConnectionController {
    transport: Arc<dyn Transport>,
    registry: SharedRegistry,
    pending: Arc<PendingResults>,
    metrics: PubSubMetricsCollector,
    sink: DeliverySink,
    state: watch::Sender<ConnectionState>,
    /// Queues dropped from the registry that still exist on the broker
    stale_queues: Mutex<HashSet<QueueName>>,
}

impl ConnectionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: SharedRegistry,
        pending: Arc<PendingResults>,
        metrics: PubSubMetricsCollector,
        sink: DeliverySink,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            registry,
            pending,
            metrics,
            sink,
            state,
            stale_queues: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the connection is up, or fail with `Timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> PubSubResult<()> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .map_err(|_| PubSubError::Timeout(timeout))?;

        waited
            .map(|_| ())
            .map_err(|_| PubSubError::ConnectionLost("connection controller stopped".to_string()))
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Apply one transport event
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => self.set_state(ConnectionState::Connecting),
            TransportEvent::Connected => {
                self.set_state(ConnectionState::Connected);
                match self.synchronize().await {
                    Ok(report) if report.is_complete() => {
                        info!(subscriptions = report.total, "Subscriptions synchronized");
                    }
                    Ok(report) => {
                        warn!(
                            bound = report.bound,
                            failed = report.failures.len(),
                            "Subscriptions partially synchronized"
                        );
                    }
                    Err(e) => error!("Failed to synchronize subscriptions: {}", e),
                }
            }
            TransportEvent::Disconnected { reason } => {
                self.set_state(ConnectionState::Disconnected);
                let failed = self
                    .pending
                    .fail_all(PubSubError::ConnectionLost(reason.clone()));
                self.metrics.record_connection_lost(failed);
                warn!(pending_failed = failed, "Connection lost: {}", reason);
            }
            TransportEvent::Confirmed {
                message_id,
                delivery_tag,
            } => {
                if self
                    .pending
                    .resolve(&message_id, AckStatus::Confirmed, Some(delivery_tag))
                {
                    self.metrics.record_confirmed();
                }
            }
            TransportEvent::Nacked {
                message_id,
                delivery_tag,
            } => {
                self.metrics.record_nacked();
                warn!(message_id = %message_id, delivery_tag, "Publish nacked by broker");
                self.pending.fail(
                    &message_id,
                    PubSubError::Transport(TransportError::PublishRejected(format!(
                        "broker nacked delivery tag {}",
                        delivery_tag
                    ))),
                );
            }
        }
    }

    /// Declare, bind and consume the queue of one registry entry
    pub async fn attach(&self, record: &SubscriptionRecord) -> PubSubResult<()> {
        let binding_failure = |e: TransportError| PubSubError::BindingFailure {
            routing_key: record.routing_key.to_string(),
            queue: record.queue.to_string(),
            reason: e.to_string(),
        };

        self.transport
            .declare_queue(&record.queue, record.options)
            .await
            .map_err(binding_failure)?;
        self.transport
            .bind(&record.queue, &record.routing_key)
            .await
            .map_err(binding_failure)?;
        self.transport
            .consume(&record.queue, self.sink.clone())
            .await
            .map_err(binding_failure)?;
        Ok(())
    }

    /// Delete a queue that no longer has subscribers. While disconnected,
    /// or if the delete fails, the queue is kept and deleted at the start
    /// of the next synchronize.
    pub async fn retire_queue(&self, queue: &QueueName) {
        if self.is_connected() {
            match self.transport.delete_queue(queue).await {
                Ok(()) => return,
                Err(e) => warn!(queue = %queue, "Failed to delete queue: {}", e),
            }
        }
        debug!(queue = %queue, "Queue deletion deferred until the next synchronize");
        lock(&self.stale_queues).insert(queue.clone());
    }

    /// Queues waiting to be deleted on the broker
    pub fn stale_queue_count(&self) -> usize {
        lock(&self.stale_queues).len()
    }

    async fn delete_stale_queues(&self) {
        let queues: Vec<QueueName> = lock(&self.stale_queues).drain().collect();
        for queue in queues {
            // Resubscribed in the meantime
            if self.registry.with(|reg| reg.callbacks_for(&queue).is_some()) {
                continue;
            }
            match self.transport.delete_queue(&queue).await {
                Ok(()) => debug!(queue = %queue, "Deleted stale queue"),
                Err(e) => {
                    warn!(queue = %queue, "Failed to delete stale queue: {}", e);
                    lock(&self.stale_queues).insert(queue);
                }
            }
        }
    }

    /// Replay every registry entry against the transport.
    ///
    /// Queues left over from unsubscribes are deleted first. Works from a
    /// snapshot so the registry lock is never held across a transport round
    /// trip. Individual failures are logged and reported; only a pass in
    /// which every entry failed is an error.
    pub async fn synchronize(&self) -> PubSubResult<SyncReport> {
        if !self.is_connected() {
            return Err(PubSubError::ConnectionLost(
                "cannot synchronize while disconnected".to_string(),
            ));
        }

        self.delete_stale_queues().await;

        let records = self.registry.with(|reg| reg.snapshot());
        let mut report = SyncReport {
            total: records.len(),
            ..SyncReport::default()
        };

        for record in &records {
            match self.attach(record).await {
                Ok(()) => {
                    report.bound += 1;
                    debug!(
                        routing_key = %record.routing_key,
                        queue = %record.queue,
                        "Subscription restored"
                    );
                }
                Err(e) => {
                    self.metrics.record_binding_failure();
                    warn!(
                        routing_key = %record.routing_key,
                        queue = %record.queue,
                        "{}", e
                    );
                    report.failures.push(e);
                }
            }
            tokio::task::yield_now().await;
        }

        if report.total > 0 && report.bound == 0 {
            return Err(PubSubError::SynchronizeFailed {
                failed: report.failures.len(),
                total: report.total,
            });
        }

        self.metrics.record_synchronize();
        Ok(report)
    }

    /// Spawn the event loop
    pub fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event).await;
            }
            debug!("Transport event stream closed");
            self.set_state(ConnectionState::Disconnected);
            self.pending.fail_all(PubSubError::ConnectionLost(
                "transport event stream closed".to_string(),
            ));
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
