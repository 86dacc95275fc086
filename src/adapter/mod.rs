//! Contract between the bus and the underlying broker
//!
//! The bus never talks to a concrete transport. Instead, an [`AdapterFactory`] is
//! handed to the [`MsbContext`](crate::MsbContext) which creates one
//! [`ProducerAdapter`] and at most one [`ConsumerAdapter`] per topic.
//!
//! Adapters deal in raw bytes only. Serialization of envelopes and the decision
//! which handler receives an inbound message are the concern of the
//! [`channel`](crate::channel) layer.

use crate::EmptyResult;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;

/// Outbound side of a topic
#[async_trait]
pub trait ProducerAdapter: Send + Sync {
    /// Hands a serialized message to the broker
    async fn publish(&self, message: &[u8]) -> EmptyResult;
}

/// Receiver of raw inbound messages
#[async_trait]
pub trait RawMessageHandler: Send + Sync {
    /// Called once per message delivered by the broker. Deliveries are acknowledged
    /// to the broker only after this call returns.
    async fn handle(&self, message: Vec<u8>);
}

/// Inbound side of a topic
#[async_trait]
pub trait ConsumerAdapter: Send + Sync {
    /// Starts delivering messages of the topic to the handler
    async fn subscribe(&self, handler: Arc<dyn RawMessageHandler>) -> EmptyResult;

    /// Stops delivering messages. Handlers which are already running are not interrupted.
    async fn unsubscribe(&self) -> EmptyResult;
}

/// Creates adapters bound to a specific broker
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Creates the outbound side of a topic
    async fn create_producer_adapter(
        &self,
        topic: &str,
    ) -> Result<Box<dyn ProducerAdapter>, crate::BoxedError>;

    /// Creates the inbound side of a topic.
    ///
    /// Response topics are private to one requester instance and thus never durable.
    async fn create_consumer_adapter(
        &self,
        topic: &str,
        is_response_topic: bool,
    ) -> Result<Box<dyn ConsumerAdapter>, crate::BoxedError>;

    /// Releases every resource held by the factory, e.g. broker connections
    async fn shutdown(&self) -> EmptyResult;
}

/// Name of the broker queue a consumer of `topic` binds to.
///
/// Consumers sharing a queue compete for messages while each queue receives a copy
/// of every message published on the topic.
pub fn queue_name(topic: &str, group_id: &str, durable: bool) -> String {
    format!("{}.{}.{}", topic, group_id, if durable { "d" } else { "t" })
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derive_queue_names() {
        assert_eq!(queue_name("test:ping", "pong", true), "test:ping.pong.d");
        assert_eq!(queue_name("test:ping", "pong", false), "test:ping.pong.t");
    }
}
