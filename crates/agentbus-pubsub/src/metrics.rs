//! Metrics collection for pub/sub operations
//!
//! Counters are cardinality-safe: per-topic counts are tracked only for the
//! first `max_topics` topic roots, never per agent or per message.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Snapshot of pub/sub counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubSubMetrics {
    /// Messages handed to the transport
    pub published_total: u64,
    /// Publishes rejected before or by the transport
    pub publish_failures_total: u64,
    /// Publishes confirmed by the broker
    pub confirmed_total: u64,
    /// Publishes accepted by a backend without confirms
    pub accepted_total: u64,
    /// Publishes negatively acknowledged
    pub nacked_total: u64,
    /// Inbound deliveries handed to at least one callback
    pub delivered_total: u64,
    /// Callback invocations that returned an error or panicked
    pub callback_failures_total: u64,
    /// Inbound deliveries dropped for a malformed envelope
    pub malformed_total: u64,
    /// Bridge frames sent to the proxy router
    pub bridge_forwards_total: u64,
    /// Bridge frames that could not be sent
    pub bridge_failures_total: u64,
    /// Queue declare/bind failures during subscribe or synchronize
    pub binding_failures_total: u64,
    /// Completed synchronize passes
    pub synchronize_total: u64,
    /// Pending results failed with `ConnectionLost`
    pub connection_lost_total: u64,
    /// Publishes per topic root (limited cardinality)
    pub publishes_by_topic: HashMap<String, u64>,
    /// When the last synchronize pass finished
    pub last_synchronized: Option<DateTime<Utc>>,
}

/// Metrics collector shared by the components of one connection
#[derive(Clone)]
pub struct PubSubMetricsCollector {
    metrics: Arc<RwLock<PubSubMetrics>>,
    /// Maximum number of topic roots to track (cardinality limit)
    max_topics: usize,
}

impl PubSubMetricsCollector {
    pub fn new(max_topics: usize) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(PubSubMetrics::default())),
            max_topics,
        }
    }

    /// Create with default limits
    pub fn with_defaults() -> Self {
        Self::new(20)
    }

    fn update(&self, f: impl FnOnce(&mut PubSubMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    /// Record a publish handed to the transport
    pub fn record_publish(&self, topic: &str) {
        let root = topic.split('/').next().unwrap_or_default().to_string();
        let max_topics = self.max_topics;
        self.update(|m| {
            m.published_total = m.published_total.saturating_add(1);
            if m.publishes_by_topic.contains_key(&root) || m.publishes_by_topic.len() < max_topics
            {
                let count = m.publishes_by_topic.entry(root).or_insert(0);
                *count = count.saturating_add(1);
            }
        });
    }

    pub fn record_publish_failure(&self) {
        self.update(|m| m.publish_failures_total = m.publish_failures_total.saturating_add(1));
    }

    pub fn record_confirmed(&self) {
        self.update(|m| m.confirmed_total = m.confirmed_total.saturating_add(1));
    }

    pub fn record_accepted(&self) {
        self.update(|m| m.accepted_total = m.accepted_total.saturating_add(1));
    }

    pub fn record_nacked(&self) {
        self.update(|m| m.nacked_total = m.nacked_total.saturating_add(1));
    }

    pub fn record_delivery(&self) {
        self.update(|m| m.delivered_total = m.delivered_total.saturating_add(1));
    }

    pub fn record_callback_failure(&self) {
        self.update(|m| m.callback_failures_total = m.callback_failures_total.saturating_add(1));
    }

    pub fn record_malformed(&self) {
        self.update(|m| m.malformed_total = m.malformed_total.saturating_add(1));
    }

    pub fn record_bridge_forward(&self) {
        self.update(|m| m.bridge_forwards_total = m.bridge_forwards_total.saturating_add(1));
    }

    pub fn record_bridge_failure(&self) {
        self.update(|m| m.bridge_failures_total = m.bridge_failures_total.saturating_add(1));
    }

    pub fn record_binding_failure(&self) {
        self.update(|m| m.binding_failures_total = m.binding_failures_total.saturating_add(1));
    }

    /// Record a finished synchronize pass
    pub fn record_synchronize(&self) {
        self.update(|m| {
            m.synchronize_total = m.synchronize_total.saturating_add(1);
            m.last_synchronized = Some(Utc::now());
        });
    }

    /// Record pending results failed by a disconnect
    pub fn record_connection_lost(&self, failed: usize) {
        let failed = u64::try_from(failed).unwrap_or(u64::MAX);
        self.update(|m| m.connection_lost_total = m.connection_lost_total.saturating_add(failed));
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> PubSubMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.update(|m| *m = PubSubMetrics::default());
    }
}

impl Default for PubSubMetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_counters() {
        let collector = PubSubMetricsCollector::with_defaults();

        collector.record_publish("devices/room1/temp");
        collector.record_publish("devices/room2/temp");
        collector.record_publish("alerts/zone1");
        collector.record_confirmed();

        let metrics = collector.snapshot();
        assert_eq!(metrics.published_total, 3);
        assert_eq!(metrics.confirmed_total, 1);
        assert_eq!(metrics.publishes_by_topic["devices"], 2);
        assert_eq!(metrics.publishes_by_topic["alerts"], 1);
    }

    #[test]
    fn test_topic_cardinality_limit() {
        let collector = PubSubMetricsCollector::new(2);

        for topic in ["a/x", "b/x", "c/x", "a/y"] {
            collector.record_publish(topic);
        }

        let metrics = collector.snapshot();
        assert_eq!(metrics.published_total, 4);
        assert_eq!(metrics.publishes_by_topic.len(), 2);
        assert_eq!(metrics.publishes_by_topic["a"], 2);
        assert!(!metrics.publishes_by_topic.contains_key("c"));
    }

    #[test]
    fn test_synchronize_timestamp() {
        let collector = PubSubMetricsCollector::with_defaults();
        assert!(collector.snapshot().last_synchronized.is_none());

        collector.record_synchronize();
        let metrics = collector.snapshot();
        assert_eq!(metrics.synchronize_total, 1);
        assert!(metrics.last_synchronized.is_some());
    }

    #[test]
    fn test_connection_lost_and_reset() {
        let collector = PubSubMetricsCollector::with_defaults();
        collector.record_connection_lost(5);
        collector.record_callback_failure();
        assert_eq!(collector.snapshot().connection_lost_total, 5);

        collector.reset();
        assert_eq!(collector.snapshot(), PubSubMetrics::default());
    }

    #[test]
    fn test_counters_saturate() {
        let collector = PubSubMetricsCollector::with_defaults();
        collector.update(|m| m.delivered_total = u64::MAX);
        collector.record_delivery();
        assert_eq!(collector.snapshot().delivered_total, u64::MAX);
    }
}
