//! Agentbus workspace facade
//!
//! Re-exports the pub/sub core and the observability setup so agents can
//! depend on a single crate.

pub use agentbus_observability as observability;
pub use agentbus_pubsub as pubsub;

pub use agentbus_observability::{ObservabilityConfig, ObservabilityError, init_observability};
pub use agentbus_pubsub::{
    AgentId, AgentIdentity, Callback, CallbackResult, Delivery, MemoryExchange, Publish, PubSub,
    PubSubConfig, PubSubError, PubSubResult, Subscribe, Topic, Unsubscribe,
};
