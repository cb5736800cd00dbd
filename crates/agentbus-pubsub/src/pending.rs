//! Pending result table
//!
//! Correlates each outbound publish with the future handed back to the
//! caller. Entries are resolved by transport confirmations, failed in bulk
//! when the connection drops, and removed when the caller times out or drops
//! the future, so the table never grows without bound.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge::BridgeStatus;
use crate::envelope::MessageId;
use crate::error::{PubSubError, PubSubResult};

/// How far a publish got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The broker confirmed the message (publisher confirms)
    Confirmed,
    /// Handed to a backend without native confirms; accepted for delivery,
    /// not known to be delivered
    Accepted,
}

/// Resolution of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub message_id: MessageId,
    pub delivery_tag: Option<u64>,
    pub status: AckStatus,
}

struct PendingEntry {
    sender: oneshot::Sender<PubSubResult<Ack>>,
    created_at: Instant,
}

/// Message id → waiting caller
pub struct PendingResults {
    entries: DashMap<MessageId, PendingEntry>,
    max_pending: usize,
}

impl PendingResults {
    pub fn new(max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            max_pending,
        })
    }

    /// Register a new pending entry and return the caller's future
    pub fn register(self: &Arc<Self>, message_id: MessageId) -> PubSubResult<PublishResult> {
        let current = self.entries.len();
        if current >= self.max_pending {
            return Err(PubSubError::PendingLimit {
                capacity: self.max_pending,
                current,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            message_id.clone(),
            PendingEntry {
                sender: tx,
                created_at: Instant::now(),
            },
        );

        Ok(PublishResult {
            message_id,
            receiver: rx,
            table: Arc::downgrade(self),
            bridge: BridgeStatus::NotRequired,
        })
    }

    /// Resolve one entry successfully. Returns `false` if the caller is
    /// already gone (timed out or dropped) and the ack was discarded.
    pub fn resolve(
        &self,
        message_id: &MessageId,
        status: AckStatus,
        delivery_tag: Option<u64>,
    ) -> bool {
        let Some((_, entry)) = self.entries.remove(message_id) else {
            debug!(message_id = %message_id, "Discarding ack for unknown message");
            return false;
        };

        let ack = Ack {
            message_id: message_id.clone(),
            delivery_tag,
            status,
        };
        if entry.sender.send(Ok(ack)).is_err() {
            debug!(message_id = %message_id, "Publish result receiver dropped");
            return false;
        }
        true
    }

    /// Fail one entry
    pub fn fail(&self, message_id: &MessageId, error: PubSubError) -> bool {
        let Some((_, entry)) = self.entries.remove(message_id) else {
            return false;
        };
        entry.sender.send(Err(error)).is_ok()
    }

    /// Fail every outstanding entry, e.g. with `ConnectionLost` on
    /// disconnect. Returns how many entries were failed.
    pub fn fail_all(&self, error: PubSubError) -> usize {
        let ids: Vec<MessageId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|(_, entry)| {
                let _ = entry.sender.send(Err(error.clone()));
            })
            .count()
    }

    /// Remove an entry without resolving it (caller gave up)
    pub fn abandon(&self, message_id: &MessageId) -> bool {
        self.entries.remove(message_id).is_some()
    }

    /// Fail entries older than `ttl` with `Timeout`
    pub fn cleanup_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.created_at) > ttl)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| {
                debug!(message_id = %id, "Cleaning up expired pending result");
                self.fail(id, PubSubError::Timeout(ttl))
            })
            .count()
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Start periodic cleanup task
    pub fn start_cleanup_task(
        self: Arc<Self>,
        interval: Duration,
        ttl: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;
                let cleaned = self.cleanup_expired(ttl);
                if cleaned > 0 {
                    debug!("Cleaned up {} expired pending results", cleaned);
                }
            }
        })
    }
}

/// Caller-side handle for one publish.
///
/// Completion is observable exactly once through [`PublishResult::get`] or
/// [`PublishResult::wait`]. Dropping the handle removes its pending entry.
pub struct PublishResult {
    message_id: MessageId,
    receiver: oneshot::Receiver<PubSubResult<Ack>>,
    table: Weak<PendingResults>,
    bridge: BridgeStatus,
}

impl PublishResult {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Outcome of forwarding this publish to the proxy router
    pub fn bridge_status(&self) -> &BridgeStatus {
        &self.bridge
    }

    pub(crate) fn set_bridge_status(&mut self, status: BridgeStatus) {
        self.bridge = status;
    }

    /// Wait for the result, giving up after `timeout`.
    ///
    /// On timeout the pending entry is removed; a later ack is discarded.
    pub async fn get(mut self, timeout: Duration) -> PubSubResult<Ack> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PubSubError::ResultAbandoned(self.message_id.to_string())),
            Err(_) => {
                if let Some(table) = self.table.upgrade() {
                    table.abandon(&self.message_id);
                }
                warn!(
                    message_id = %self.message_id,
                    "Publish result timed out after {:?}", timeout
                );
                Err(PubSubError::Timeout(timeout))
            }
        }
    }

    /// Wait for the result without a deadline
    pub async fn wait(mut self) -> PubSubResult<Ack> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(PubSubError::ResultAbandoned(self.message_id.to_string())),
        }
    }

    /// Non-blocking check; `None` while still pending
    pub fn try_get(&mut self) -> Option<PubSubResult<Ack>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(
                PubSubError::ResultAbandoned(self.message_id.to_string()),
            )),
        }
    }
}

impl Drop for PublishResult {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.abandon(&self.message_id);
        }
    }
}

impl std::fmt::Debug for PublishResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishResult")
            .field("message_id", &self.message_id)
            .field("bridge", &self.bridge)
            .finish()
    }
}
