//! Topic level multiplexing onto transport adapters
//!
//! The [`ChannelManager`] owns at most one [`Producer`] and one [`Consumer`] per
//! topic. Producers are created lazily on first use and live until shutdown.
//! Consumers are created explicitly and subscribing twice to the same topic is
//! rejected, as it indicates two parts of the application fighting over one topic.

mod consumer;
mod invoker;
mod monitor;
mod producer;

pub use consumer::{Consumer, FixedHandlerResolver, MessageHandler, MessageHandlerResolver};
pub use invoker::{DirectInvoker, HandlerJob, MessageHandlerInvoker, ThreadPoolInvoker};
pub use monitor::{ChannelMonitorAgent, NoopChannelMonitorAgent};
pub use producer::Producer;

use crate::adapter::AdapterFactory;
use crate::message::validate_topic;
use crate::MsbError;
use futures::lock::Mutex;
use monitor::SharedMonitor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Registry of producers and consumers
pub struct ChannelManager {
    factory: Arc<dyn AdapterFactory>,
    invoker: Arc<dyn MessageHandlerInvoker>,
    monitor: SharedMonitor,
    producers: Mutex<HashMap<String, Arc<Producer>>>,
    consumers: Mutex<HashMap<String, Consumer>>,
}

impl ChannelManager {
    /// Creates a new manager creating adapters with the given factory
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        invoker: Arc<dyn MessageHandlerInvoker>,
        monitor: Arc<dyn ChannelMonitorAgent>,
    ) -> Self {
        Self {
            factory,
            invoker,
            monitor: SharedMonitor::new(monitor),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the agent observing channel activity
    pub fn set_monitor_agent(&self, agent: Arc<dyn ChannelMonitorAgent>) {
        self.monitor.replace(agent);
    }

    /// Returns the producer of the topic, creating it if necessary
    pub async fn find_or_create_producer(&self, topic: &str) -> Result<Arc<Producer>, MsbError> {
        validate_topic(topic)?;

        let mut producers = self.producers.lock().await;

        if let Some(producer) = producers.get(topic) {
            return Ok(producer.clone());
        }

        let adapter = self
            .factory
            .create_producer_adapter(topic)
            .await
            .map_err(|e| MsbError::channel(topic, e))?;

        let producer = Arc::new(Producer::new(topic, adapter, self.monitor.clone()));
        producers.insert(topic.to_owned(), producer.clone());

        debug!(topic, "Created producer");
        self.monitor
            .notify(|agent| agent.producer_topic_created(topic));

        Ok(producer)
    }

    /// Delivers every message of the topic to the handler
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MsbError> {
        self.create_consumer(topic, Arc::new(FixedHandlerResolver(handler)), false)
            .await
    }

    /// Routes replies received on a response topic through the resolver
    pub async fn subscribe_for_responses(
        &self,
        topic: &str,
        resolver: Arc<dyn MessageHandlerResolver>,
    ) -> Result<(), MsbError> {
        self.create_consumer(topic, resolver, true).await
    }

    #[instrument(skip(self, resolver))]
    async fn create_consumer(
        &self,
        topic: &str,
        resolver: Arc<dyn MessageHandlerResolver>,
        is_response_topic: bool,
    ) -> Result<(), MsbError> {
        validate_topic(topic)?;

        let mut consumers = self.consumers.lock().await;

        if consumers.contains_key(topic) {
            return Err(MsbError::ConsumerSubscription(topic.to_owned()));
        }

        let adapter = self
            .factory
            .create_consumer_adapter(topic, is_response_topic)
            .await
            .map_err(|e| MsbError::channel(topic, e))?;

        let consumer = Consumer::new(
            topic,
            adapter,
            resolver,
            self.invoker.clone(),
            self.monitor.clone(),
        );

        consumer.subscribe().await?;
        consumers.insert(topic.to_owned(), consumer);

        info!("Subscribed to topic");
        self.monitor
            .notify(|agent| agent.consumer_topic_created(topic));

        Ok(())
    }

    /// Stops consuming from the topic, does nothing if there is no consumer
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MsbError> {
        let mut consumers = self.consumers.lock().await;

        if let Some(consumer) = consumers.remove(topic) {
            consumer.end().await?;

            info!("Unsubscribed from topic");
            self.monitor
                .notify(|agent| agent.consumer_topic_removed(topic));
        }

        Ok(())
    }

    /// Whether a consumer for the topic exists
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.consumers.lock().await.contains_key(topic)
    }

    /// Tears down every adapter and the handler invoker.
    ///
    /// Failures are logged and do not prevent the remaining resources from being released.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let consumers: Vec<(String, Consumer)> = self.consumers.lock().await.drain().collect();

        for (topic, consumer) in consumers {
            match consumer.end().await {
                Ok(_) => self
                    .monitor
                    .notify(|agent| agent.consumer_topic_removed(&topic)),
                Err(e) => warn!(topic = %topic, error = %e, "Failed to unsubscribe"),
            }
        }

        self.producers.lock().await.clear();

        if let Err(e) = self.factory.shutdown().await {
            warn!(error = %e, "Failed to shut down adapter factory");
        }

        self.invoker.shutdown().await;
        info!("Channel manager shut down");
    }
}
