//! Subscription registry: routing key → queue → callbacks
//!
//! The registry is the in-memory source of truth for what this connection
//! is subscribed to. Broker-side queues and bindings are derived from it and
//! replayed on every (re)connect, so it must stay consistent even when a
//! transport round trip fails halfway.
//!
//! Callbacks are held weakly: the agent owns the `Arc`, and dropping it
//! silently ends delivery to that callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::envelope::Delivery;
use crate::error::{PubSubError, PubSubResult};
use crate::types::{QueueName, QueueOptions, RoutingKey};

/// Error type a subscriber callback may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a subscriber callback
pub type CallbackResult = Result<(), CallbackError>;

/// A subscriber callback invoked for every matching delivery
pub trait Subscriber: Send + Sync {
    fn on_message(&self, delivery: &Delivery) -> CallbackResult;
}

impl<F> Subscriber for F
where
    F: Fn(&Delivery) -> CallbackResult + Send + Sync,
{
    fn on_message(&self, delivery: &Delivery) -> CallbackResult {
        self(delivery)
    }
}

/// Strong handle to a subscriber, owned by agent code
pub type Callback = Arc<dyn Subscriber>;

fn same_callback(held: &Weak<dyn Subscriber>, callback: &Callback) -> bool {
    std::ptr::addr_eq(held.as_ptr(), Arc::as_ptr(callback))
}

#[derive(Clone)]
struct QueueEntry {
    options: QueueOptions,
    bus: String,
    callbacks: Vec<Weak<dyn Subscriber>>,
}

impl QueueEntry {
    fn live_callbacks(&self) -> Vec<Callback> {
        self.callbacks.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Owned view of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub routing_key: RoutingKey,
    pub queue: QueueName,
    pub options: QueueOptions,
    pub bus: String,
    pub callbacks: usize,
}

/// What a successful [`SubscriptionRegistry::remove`] took out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    /// Routing keys a callback or queue was removed from
    pub routing_keys: Vec<RoutingKey>,
    /// Queues left without callbacks, to be deleted on the broker
    pub deleted_queues: Vec<QueueName>,
}

/// Routing key → queue name → callback set
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<RoutingKey, HashMap<QueueName, QueueEntry>>,
    queue_index: HashMap<QueueName, RoutingKey>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `callback` to the `(routing_key, queue)` entry, creating it if
    /// needed. Returns `false` when the callback was already registered.
    pub fn add(
        &mut self,
        routing_key: &RoutingKey,
        queue: &QueueName,
        options: QueueOptions,
        bus: &str,
        callback: &Callback,
    ) -> PubSubResult<bool> {
        if let Some(existing) = self.queue_index.get(queue)
            && existing != routing_key
        {
            return Err(PubSubError::QueueConflict {
                queue: queue.to_string(),
                existing: existing.to_string(),
            });
        }

        let entry = self
            .entries
            .entry(routing_key.clone())
            .or_default()
            .entry(queue.clone())
            .or_insert_with(|| QueueEntry {
                options,
                bus: bus.to_string(),
                callbacks: Vec::new(),
            });
        self.queue_index
            .insert(queue.clone(), routing_key.clone());

        entry.callbacks.retain(|held| held.strong_count() > 0);
        if entry.callbacks.iter().any(|held| same_callback(held, callback)) {
            return Ok(false);
        }
        entry.callbacks.push(Arc::downgrade(callback));
        Ok(true)
    }

    /// Remove subscriptions.
    ///
    /// - no key, callback: remove the callback wherever it appears
    /// - key, no callback: drop every queue under the key
    /// - key and callback: remove the callback from queues under the key
    ///
    /// Queues left empty are dropped and reported in
    /// [`Removal::deleted_queues`]. Fails with `NoSuchSubscription` when
    /// nothing matched.
    pub fn remove(
        &mut self,
        routing_key: Option<&RoutingKey>,
        callback: Option<&Callback>,
    ) -> PubSubResult<Removal> {
        let mut removal = Removal::default();

        match (routing_key, callback) {
            (None, None) => return Ok(removal),
            (Some(key), None) => {
                let queues = self.entries.remove(key).ok_or_else(|| {
                    PubSubError::NoSuchSubscription(format!("no subscriptions for {}", key))
                })?;
                removal.routing_keys.push(key.clone());
                for queue in queues.into_keys() {
                    self.queue_index.remove(&queue);
                    removal.deleted_queues.push(queue);
                }
            }
            (Some(key), Some(callback)) => {
                let Some(queues) = self.entries.get_mut(key) else {
                    return Err(PubSubError::NoSuchSubscription(format!(
                        "no subscriptions for {}",
                        key
                    )));
                };
                if Self::remove_callback_from(queues, callback, &mut removal.deleted_queues) {
                    removal.routing_keys.push(key.clone());
                }
                if queues.is_empty() {
                    self.entries.remove(key);
                }
            }
            (None, Some(callback)) => {
                for (key, queues) in self.entries.iter_mut() {
                    if Self::remove_callback_from(queues, callback, &mut removal.deleted_queues) {
                        removal.routing_keys.push(key.clone());
                    }
                }
                self.entries.retain(|_, queues| !queues.is_empty());
            }
        }

        for queue in &removal.deleted_queues {
            self.queue_index.remove(queue);
        }

        if removal.routing_keys.is_empty() {
            return Err(PubSubError::NoSuchSubscription(
                "callback is not subscribed".to_string(),
            ));
        }
        Ok(removal)
    }

    /// Returns whether `callback` was found under any queue
    fn remove_callback_from(
        queues: &mut HashMap<QueueName, QueueEntry>,
        callback: &Callback,
        deleted: &mut Vec<QueueName>,
    ) -> bool {
        let mut found = false;
        queues.retain(|queue, entry| {
            let before = entry.callbacks.len();
            entry.callbacks.retain(|held| !same_callback(held, callback));
            if entry.callbacks.len() != before {
                found = true;
            }
            entry.callbacks.retain(|held| held.strong_count() > 0);
            if entry.callbacks.is_empty() {
                deleted.push(queue.clone());
                false
            } else {
                true
            }
        });
        found
    }

    /// `(routing_key, queue)` pairs whose key starts with `prefix`, or with
    /// `reverse`, whose key is itself a prefix of `prefix`. Unordered.
    pub fn list(&self, prefix: &str, reverse: bool) -> Vec<(RoutingKey, QueueName)> {
        self.entries
            .iter()
            .filter(|(key, _)| {
                if reverse {
                    prefix.starts_with(key.as_str())
                } else {
                    key.as_str().starts_with(prefix)
                }
            })
            .flat_map(|(key, queues)| queues.keys().map(move |q| (key.clone(), q.clone())))
            .collect()
    }

    /// The generated queue already serving `routing_key` on `bus`, if any
    pub fn ephemeral_queue_for(&self, routing_key: &RoutingKey, bus: &str) -> Option<QueueName> {
        self.entries.get(routing_key).and_then(|queues| {
            queues
                .iter()
                .find(|(_, entry)| entry.options.auto_delete && entry.bus == bus)
                .map(|(queue, _)| queue.clone())
        })
    }

    /// Live callbacks registered on `queue`, with the queue's binding key
    pub fn callbacks_for(&self, queue: &QueueName) -> Option<(RoutingKey, Vec<Callback>)> {
        let key = self.queue_index.get(queue)?;
        let entry = self.entries.get(key)?.get(queue)?;
        Some((key.clone(), entry.live_callbacks()))
    }

    /// Drop callbacks whose owners are gone. Returns `true` if the queue was
    /// left empty and removed.
    pub fn prune(&mut self, queue: &QueueName) -> bool {
        let Some(key) = self.queue_index.get(queue).cloned() else {
            return false;
        };
        let Some(queues) = self.entries.get_mut(&key) else {
            return false;
        };

        let emptied = match queues.get_mut(queue) {
            Some(entry) => {
                entry.callbacks.retain(|held| held.strong_count() > 0);
                entry.callbacks.is_empty()
            }
            None => false,
        };

        if emptied {
            queues.remove(queue);
            if queues.is_empty() {
                self.entries.remove(&key);
            }
            self.queue_index.remove(queue);
        }
        emptied
    }

    /// Owned copy of every entry, for work that must not hold the lock
    pub fn snapshot(&self) -> Vec<SubscriptionRecord> {
        self.entries
            .iter()
            .flat_map(|(key, queues)| {
                queues.iter().map(move |(queue, entry)| SubscriptionRecord {
                    routing_key: key.clone(),
                    queue: queue.clone(),
                    options: entry.options,
                    bus: entry.bus.clone(),
                    callbacks: entry.callbacks.len(),
                })
            })
            .collect()
    }

    /// Number of distinct routing keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn queue_count(&self) -> usize {
        self.queue_index.len()
    }

    /// Remove everything, returning the queues that were registered
    pub fn clear(&mut self) -> Vec<SubscriptionRecord> {
        let records = self.snapshot();
        self.entries.clear();
        self.queue_index.clear();
        records
    }
}

/// Registry shared between the components of one connection.
///
/// Access goes through [`SharedRegistry::with`], which takes a synchronous
/// closure so the lock can never be held across an `.await`.
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<Mutex<SubscriptionRegistry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SubscriptionRegistry) -> R) -> R {
        let mut guard: MutexGuard<'_, SubscriptionRegistry> =
            self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback() -> Callback {
        Arc::new(|_: &Delivery| -> CallbackResult { Ok(()) })
    }

    fn key(s: &str) -> RoutingKey {
        RoutingKey::new(s)
    }

    fn queue(s: &str) -> QueueName {
        QueueName::new(s)
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut reg = SubscriptionRegistry::new();
        let cb = callback();
        assert!(reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &cb).unwrap());
        assert!(!reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &cb).unwrap());

        let (_, callbacks) = reg.callbacks_for(&queue("q")).unwrap();
        assert_eq!(callbacks.len(), 1);
    }

    #[test]
    fn test_fan_in_on_one_queue() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        let b = callback();
        reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &a).unwrap();
        reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &b).unwrap();

        assert_eq!(reg.queue_count(), 1);
        assert_eq!(reg.callbacks_for(&queue("q")).unwrap().1.len(), 2);
    }

    #[test]
    fn test_queue_conflict() {
        let mut reg = SubscriptionRegistry::new();
        let cb = callback();
        reg.add(&key("k1"), &queue("q"), QueueOptions::persistent(), "", &cb).unwrap();
        let err = reg
            .add(&key("k2"), &queue("q"), QueueOptions::persistent(), "", &cb)
            .unwrap_err();
        assert!(matches!(err, PubSubError::QueueConflict { .. }));
    }

    #[test]
    fn test_remove_callback_everywhere() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        let b = callback();
        reg.add(&key("k1"), &queue("q1"), QueueOptions::ephemeral(), "", &a).unwrap();
        reg.add(&key("k2"), &queue("q2"), QueueOptions::ephemeral(), "", &a).unwrap();
        reg.add(&key("k2"), &queue("q2"), QueueOptions::ephemeral(), "", &b).unwrap();

        let removal = reg.remove(None, Some(&a)).unwrap();
        assert_eq!(removal.routing_keys.len(), 2);
        assert_eq!(removal.deleted_queues, vec![queue("q1")]);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.callbacks_for(&queue("q2")).unwrap().1.len(), 1);
    }

    #[test]
    fn test_remove_by_key_drops_all_queues() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        reg.add(&key("k"), &queue("q1"), QueueOptions::ephemeral(), "", &a).unwrap();
        reg.add(&key("k"), &queue("q2"), QueueOptions::persistent(), "", &a).unwrap();

        let mut removal = reg.remove(Some(&key("k")), None).unwrap();
        removal.deleted_queues.sort();
        assert_eq!(removal.deleted_queues, vec![queue("q1"), queue("q2")]);
        assert!(reg.is_empty());
        assert_eq!(reg.queue_count(), 0);
    }

    #[test]
    fn test_remove_targeted_callback_keeps_other() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        let b = callback();
        reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &a).unwrap();
        reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &b).unwrap();

        let removal = reg.remove(Some(&key("k")), Some(&a)).unwrap();
        assert_eq!(removal.routing_keys, vec![key("k")]);
        assert!(removal.deleted_queues.is_empty());

        let (_, remaining) = reg.callbacks_for(&queue("q")).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }

    #[test]
    fn test_remove_missing_is_error() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        assert!(matches!(
            reg.remove(None, Some(&a)),
            Err(PubSubError::NoSuchSubscription(_))
        ));
        assert!(matches!(
            reg.remove(Some(&key("k")), None),
            Err(PubSubError::NoSuchSubscription(_))
        ));

        let b = callback();
        reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &b).unwrap();
        assert!(matches!(
            reg.remove(Some(&key("k")), Some(&a)),
            Err(PubSubError::NoSuchSubscription(_))
        ));
        assert_eq!(reg.queue_count(), 1);
    }

    #[test]
    fn test_remove_nothing_requested() {
        let mut reg = SubscriptionRegistry::new();
        assert_eq!(reg.remove(None, None).unwrap(), Removal::default());
    }

    #[test]
    fn test_list_prefix_and_reverse() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        reg.add(&key("__pubsub__.v1.devices.#"), &queue("q1"), QueueOptions::ephemeral(), "", &a)
            .unwrap();
        reg.add(&key("__pubsub__.v1.alerts.#"), &queue("q2"), QueueOptions::ephemeral(), "", &a)
            .unwrap();

        assert_eq!(reg.list("__pubsub__.v1.dev", false).len(), 1);
        assert_eq!(reg.list("", false).len(), 2);
        assert_eq!(reg.list("__pubsub__.v1.alerts.#.extra", true).len(), 1);
        assert!(reg.list("__pubsub__.v2", false).is_empty());
    }

    #[test]
    fn test_ephemeral_queue_lookup() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        reg.add(&key("k"), &queue("named"), QueueOptions::persistent(), "", &a).unwrap();
        assert_eq!(reg.ephemeral_queue_for(&key("k"), ""), None);

        reg.add(&key("k"), &queue("gen"), QueueOptions::ephemeral(), "", &a).unwrap();
        assert_eq!(reg.ephemeral_queue_for(&key("k"), ""), Some(queue("gen")));
        assert_eq!(reg.ephemeral_queue_for(&key("k"), "other-bus"), None);
    }

    #[test]
    fn test_dropped_callbacks_are_pruned() {
        let mut reg = SubscriptionRegistry::new();
        let keep = callback();
        {
            let gone = callback();
            reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &gone).unwrap();
        }
        assert!(reg.callbacks_for(&queue("q")).unwrap().1.is_empty());
        assert!(reg.prune(&queue("q")));
        assert!(reg.is_empty());

        reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &keep).unwrap();
        assert!(!reg.prune(&queue("q")));
    }

    #[test]
    fn test_snapshot_and_clear() {
        let mut reg = SubscriptionRegistry::new();
        let a = callback();
        reg.add(&key("k"), &queue("q"), QueueOptions::persistent(), "bus1", &a).unwrap();

        let snapshot = reg.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].bus, "bus1");
        assert!(snapshot[0].options.durable);

        assert_eq!(reg.clear().len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_shared_registry() {
        let shared = SharedRegistry::new();
        let a = callback();
        shared
            .with(|reg| reg.add(&key("k"), &queue("q"), QueueOptions::ephemeral(), "", &a))
            .unwrap();
        assert_eq!(shared.with(|reg| reg.len()), 1);
    }
}
