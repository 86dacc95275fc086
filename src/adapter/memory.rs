//! Broker living entirely within the current process
//!
//! Mimics the routing model of an AMQP broker: every topic is a fanout exchange
//! and every queue bound to it receives a copy of each message. Consumers bound
//! to the same queue compete for its messages in a round-robin fashion, each one
//! holding at most `prefetch_count` messages which it has not finished handling. Durable
//! queues retain messages while no consumer is bound, transient queues are
//! dropped together with their last consumer.

use super::{AdapterFactory, ConsumerAdapter, ProducerAdapter, RawMessageHandler};
use crate::config::BrokerOptions;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};
use uuid::Uuid;

struct Subscription {
    id: u64,
    sender: UnboundedSender<Vec<u8>>,
    prefetch: usize,
    unsettled: usize,
}

#[derive(Default)]
struct Queue {
    durable: bool,
    consumers: Vec<Subscription>,
    next_consumer: usize,
    pending: VecDeque<Vec<u8>>,
}

impl Queue {
    /// Hands pending messages to consumers with free prefetch capacity, round-robin
    fn dispatch(&mut self) {
        while !self.pending.is_empty() && !self.consumers.is_empty() {
            let count = self.consumers.len();
            let free = (0..count)
                .map(|offset| (self.next_consumer + offset) % count)
                .find(|index| {
                    let consumer = &self.consumers[*index];
                    consumer.unsettled < consumer.prefetch
                });

            let index = match free {
                Some(index) => index,
                None => return,
            };

            let message = match self.pending.pop_front() {
                Some(message) => message,
                None => return,
            };

            self.next_consumer = index + 1;
            let consumer = &mut self.consumers[index];

            match consumer.sender.send(message) {
                Ok(_) => consumer.unsettled += 1,
                Err(returned) => {
                    // Receiving task is gone
                    self.pending.push_front(returned.0);
                    self.consumers.remove(index);
                }
            }
        }

        if self.consumers.is_empty() && !self.durable {
            self.pending.clear();
        }
    }
}

/// Shared in-process message broker
#[derive(Default)]
pub struct InMemoryBroker {
    exchanges: Mutex<HashMap<String, HashMap<String, Queue>>>,
    consumer_ids: AtomicU64,
}

impl InMemoryBroker {
    /// Creates an empty broker
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn exchanges(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Queue>>> {
        self.exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes a message to every queue bound to the topic
    pub fn publish(&self, topic: &str, message: Vec<u8>) {
        let mut exchanges = self.exchanges();

        match exchanges.get_mut(topic) {
            Some(queues) => {
                trace!(topic, queues = queues.len(), "Routing message");
                for queue in queues.values_mut() {
                    queue.pending.push_back(message.clone());
                    queue.dispatch();
                }
            }
            None => trace!(topic, "Dropping message without bound queue"),
        }
    }

    /// Injects a raw message as if it had been published by a remote service
    pub fn push_raw(&self, topic: &str, message: impl Into<Vec<u8>>) {
        self.publish(topic, message.into());
    }

    /// Number of consumers currently bound to any queue of the topic
    pub fn consumer_count(&self, topic: &str) -> usize {
        self.exchanges()
            .get(topic)
            .map(|queues| queues.values().map(|q| q.consumers.len()).sum())
            .unwrap_or(0)
    }

    /// Drops every queue and thereby stops all deliveries
    pub fn shutdown(&self) {
        debug!("Shutting down in-memory broker");
        self.exchanges().clear();
    }

    fn bind(
        &self,
        topic: &str,
        queue: &str,
        durable: bool,
        prefetch: usize,
    ) -> (u64, UnboundedReceiver<Vec<u8>>) {
        let id = self.consumer_ids.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded_channel();

        let mut exchanges = self.exchanges();
        let queue = exchanges
            .entry(topic.to_owned())
            .or_default()
            .entry(queue.to_owned())
            .or_default();

        queue.durable = durable;
        queue.consumers.push(Subscription {
            id,
            sender,
            prefetch: prefetch.max(1),
            unsettled: 0,
        });
        queue.dispatch();

        (id, receiver)
    }

    /// Marks a delivered message as processed which frees prefetch capacity of the consumer
    fn settle(&self, topic: &str, queue_name: &str, consumer: u64) {
        let mut exchanges = self.exchanges();

        let queue = exchanges
            .get_mut(topic)
            .and_then(|queues| queues.get_mut(queue_name));

        if let Some(queue) = queue {
            if let Some(subscription) = queue.consumers.iter_mut().find(|s| s.id == consumer) {
                subscription.unsettled = subscription.unsettled.saturating_sub(1);
            }

            queue.dispatch();
        }
    }

    fn unbind(&self, topic: &str, queue_name: &str, consumer: u64) {
        let mut exchanges = self.exchanges();

        if let Some(queues) = exchanges.get_mut(topic) {
            if let Some(queue) = queues.get_mut(queue_name) {
                queue.consumers.retain(|s| s.id != consumer);

                if queue.consumers.is_empty() && !queue.durable {
                    queues.remove(queue_name);
                } else {
                    queue.dispatch();
                }
            }

            if queues.is_empty() {
                exchanges.remove(topic);
            }
        }
    }
}

struct InMemoryProducerAdapter {
    broker: Arc<InMemoryBroker>,
    topic: String,
}

#[async_trait]
impl ProducerAdapter for InMemoryProducerAdapter {
    async fn publish(&self, message: &[u8]) -> EmptyResult {
        self.broker.publish(&self.topic, message.to_vec());
        Ok(())
    }
}

struct InMemoryConsumerAdapter {
    broker: Arc<InMemoryBroker>,
    topic: String,
    queue: String,
    durable: bool,
    prefetch: usize,
    consumer: Mutex<Option<u64>>,
}

#[async_trait]
impl ConsumerAdapter for InMemoryConsumerAdapter {
    async fn subscribe(&self, handler: Arc<dyn RawMessageHandler>) -> EmptyResult {
        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);

        if consumer.is_some() {
            return Err(format!("already consuming from queue {}", self.queue).into());
        }

        let (id, mut receiver) =
            self.broker
                .bind(&self.topic, &self.queue, self.durable, self.prefetch);
        *consumer = Some(id);

        debug!(topic = %self.topic, queue = %self.queue, prefetch = self.prefetch, "Bound consumer");

        let broker = self.broker.clone();
        let topic = self.topic.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                handler.handle(message).await;
                broker.settle(&topic, &queue, id);
            }
        });

        Ok(())
    }

    async fn unsubscribe(&self) -> EmptyResult {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(id) = consumer {
            self.broker.unbind(&self.topic, &self.queue, id);
            debug!(topic = %self.topic, queue = %self.queue, "Unbound consumer");
        }

        Ok(())
    }
}

/// Creates adapters connected to an [`InMemoryBroker`]
pub struct InMemoryAdapterFactory {
    broker: Arc<InMemoryBroker>,
    options: BrokerOptions,
}

impl InMemoryAdapterFactory {
    /// Creates a new factory, queue naming follows the given options
    pub fn new(broker: Arc<InMemoryBroker>, options: BrokerOptions) -> Self {
        Self { broker, options }
    }

    /// Broker the created adapters are connected to
    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl AdapterFactory for InMemoryAdapterFactory {
    async fn create_producer_adapter(
        &self,
        topic: &str,
    ) -> Result<Box<dyn ProducerAdapter>, BoxedError> {
        Ok(Box::new(InMemoryProducerAdapter {
            broker: self.broker.clone(),
            topic: topic.to_owned(),
        }))
    }

    async fn create_consumer_adapter(
        &self,
        topic: &str,
        is_response_topic: bool,
    ) -> Result<Box<dyn ConsumerAdapter>, BoxedError> {
        let durable = !is_response_topic && self.options.durable;
        let group_id = match (&self.options.group_id, is_response_topic) {
            (Some(group_id), false) => group_id.clone(),
            _ => Uuid::new_v4().to_string(),
        };

        Ok(Box::new(InMemoryConsumerAdapter {
            broker: self.broker.clone(),
            topic: topic.to_owned(),
            queue: super::queue_name(topic, &group_id, durable),
            durable,
            prefetch: usize::from(self.options.prefetch_count),
            consumer: Mutex::new(None),
        }))
    }

    async fn shutdown(&self) -> EmptyResult {
        // The broker may be shared with other contexts and outlives the factory
        debug!("Shutting down in-memory adapter factory");
        Ok(())
    }
}
