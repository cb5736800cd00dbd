//! # Agentbus Pub/Sub
//!
//! Topic publish/subscribe for agents connected to a brokered topic
//! exchange.
//!
//! This crate maps slash-separated agent topics onto dot-separated exchange
//! routing keys, keeps the subscriptions of one agent connection in sync
//! with the broker across reconnects, and turns broker publish confirmations
//! into awaitable results.
//!
//! ## Features
//!
//! - **Routing**: Local and all-platform routing keys with `*`/`#` wildcards
//! - **Subscriptions**: Shared ephemeral queues per prefix, named durable queues
//! - **Reconnects**: Every subscription is re-bound when the transport reconnects
//! - **Delivery confirmation**: Per-publish results resolved by broker confirms
//! - **Bridging**: Subscribe/publish frames forwarded to the platform proxy router
//! - **Observability**: Counters for publishes, confirms, deliveries and failures
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentbus_pubsub::{
//!     AgentId, AgentIdentity, Callback, CallbackResult, Delivery, MemoryExchange, Publish,
//!     PubSub, PubSubConfig, Subscribe, Topic,
//! };
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exchange = MemoryExchange::new();
//!     let identity = AgentIdentity::new(AgentId::parse("listener")?, "volttron1");
//!     let pubsub = PubSub::start(identity, exchange.connect("volttron1"), PubSubConfig::from_env()?)?;
//!     pubsub.wait_connected(Duration::from_secs(5)).await?;
//!
//!     let on_device: Callback = Arc::new(|d: &Delivery| -> CallbackResult {
//!         println!("{} from {}: {}", d.topic, d.sender, d.message);
//!         Ok(())
//!     });
//!     pubsub
//!         .subscribe(Subscribe::new(Topic::parse("devices")?, on_device.clone()))
//!         .await?;
//!
//!     let ack = pubsub
//!         .publish_and_wait(Publish::new(Topic::parse("devices/room1/temp")?, json!(72.5)))
//!         .await?;
//!     println!("published {} ({:?})", ack.message_id, ack.status);
//!
//!     pubsub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod pending;
pub mod publisher;
pub mod pubsub;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

pub use bridge::{BridgeFrame, BridgeRequest, BridgeStatus};
pub use codec::{decode, encode, key_matches};
pub use config::{ConfigError, PubSubConfig};
pub use dispatcher::DispatchOutcome;
pub use envelope::{Delivery, Envelope, Headers, MessageId, PublishProperties, RawDelivery};
pub use error::{PubSubError, PubSubResult, TransportError, TransportResult};
pub use lifecycle::{ConnectionState, SyncReport};
pub use memory::{MemoryExchange, MemoryTransport, PublishedRecord};
pub use metrics::{PubSubMetrics, PubSubMetricsCollector};
pub use pending::{Ack, AckStatus, PublishResult};
pub use pubsub::{Publish, PubSub, Subscribe, Subscription, Unsubscribe};
pub use registry::{Callback, CallbackError, CallbackResult, Subscriber};
pub use transport::{DeliverySink, PublishOutcome, Transport, TransportEvent};
pub use types::{
    AgentId, AgentIdentity, IdValidationError, QueueName, QueueOptions, RoutingKey, Scope, Topic,
};

#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisTransport};
