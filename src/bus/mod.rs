//! Durable, topic-routed message bus.
//!
//! Producers publish JSON bodies to a topic exchange under a routing key;
//! bindings copy each message into every queue whose pattern matches. A
//! consumer fetches one delivery at a time and must `ack` it, or `nack` it
//! with or without requeue. Unacknowledged deliveries survive a crash and
//! come back on `recover`, which gives at-least-once delivery.

pub mod consumer;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use flowboard_common::{Encode, Event, RiskAlert};

use crate::errors::{BusError, PublishError};

pub use consumer::{ConsumerConfig, ConsumerStats, Handler, run_consumer};
pub use sqlite::SqliteBus;

// ── Topology ──────────────────────────────────────────────────────────

pub const EVENTS_EXCHANGE: &str = "flowboard.events";
pub const EVENTS_QUEUE: &str = "flowboard.events.queue";
pub const EVENT_ROUTING_KEY: &str = "flowboard.event";

pub const RISK_EXCHANGE: &str = "flowboard.risk";
pub const RISK_QUEUE: &str = "allocator.risk.queue";
pub const RISK_BINDING: &str = "risk.*";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One message handed to a consumer. `tag` identifies the delivery for
/// `ack`/`nack` and is only valid until one of those is called.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: i64,
    pub message_id: Uuid,
    pub queue: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Times this message has been handed out, this delivery included.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Route `body` to every queue bound to `exchange` with a pattern
    /// matching `routing_key`. Messages matching no binding are dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), PublishError>;

    /// Take the oldest ready message of `queue`, marking it unacknowledged.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BusError>;

    async fn ack(&self, tag: i64) -> Result<(), BusError>;

    /// Reject a delivery. With `requeue` the message goes to the back of its
    /// queue, otherwise it is discarded.
    async fn nack(&self, tag: i64, requeue: bool) -> Result<(), BusError>;

    /// Resolves when a publish may have made new messages available.
    /// Implementations without notifications never resolve, and consumers
    /// fall back to polling.
    async fn published(&self) {
        std::future::pending::<()>().await
    }
}

/// Encode and publish one message.
pub async fn publish_message<M: Encode + Sync>(
    bus: &dyn MessageBus,
    exchange: &str,
    routing_key: &str,
    message: &M,
) -> Result<(), PublishError> {
    let body = message.encode().map_err(PublishError::Encode)?;
    bus.publish(exchange, routing_key, body).await
}

/// Publish a board event to the primary event exchange.
pub async fn publish_event(bus: &dyn MessageBus, event: &Event) -> Result<(), PublishError> {
    publish_message(bus, EVENTS_EXCHANGE, EVENT_ROUTING_KEY, event).await
}

/// Publish a risk alert under `risk.<type>`.
pub async fn publish_alert(bus: &dyn MessageBus, alert: &RiskAlert) -> Result<(), PublishError> {
    publish_message(bus, RISK_EXCHANGE, &alert.routing_key(), alert).await
}

/// AMQP topic matching: words are dot-separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && match_words(rest, key_rest)
        }
        _ => false,
    }
}
