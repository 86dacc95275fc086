use super::Collector;
use crate::channel::{ChannelManager, MessageHandler, MessageHandlerResolver};
use crate::message::Message;
use crate::MsbError;
use futures::lock::Mutex as AsyncMutex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

/// Routes the replies received on one response topic to their conversations
///
/// The topic is subscribed while at least one collector is registered. Lookups
/// for inbound replies only touch the collector map, registration and removal
/// are additionally serialized with the subscription state so that subscribing
/// and unsubscribing happen exactly once per transition.
pub struct CollectorManager {
    topic: String,
    channels: Arc<ChannelManager>,
    collectors: Mutex<HashMap<String, Arc<Collector>>>,
    subscribed: AsyncMutex<bool>,
}

impl CollectorManager {
    /// Creates a manager for replies arriving on `topic`
    pub fn new(topic: &str, channels: Arc<ChannelManager>) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_owned(),
            channels,
            collectors: Mutex::new(HashMap::new()),
            subscribed: AsyncMutex::new(false),
        })
    }

    /// Response topic handled by this manager
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn collectors(&self) -> MutexGuard<'_, HashMap<String, Arc<Collector>>> {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Collector of the conversation, if it is still ongoing
    pub fn find(&self, correlation_id: &str) -> Option<Arc<Collector>> {
        self.collectors().get(correlation_id).cloned()
    }

    /// Whether no conversation is ongoing
    pub fn is_empty(&self) -> bool {
        self.collectors().is_empty()
    }

    /// Starts routing replies to the collector, subscribing to the topic if necessary.
    ///
    /// Registering a second collector for the same correlation id keeps the first one.
    #[instrument(skip(self, collector), fields(topic = %self.topic, correlation_id = %collector.correlation_id()))]
    pub async fn register(self: &Arc<Self>, collector: Arc<Collector>) -> Result<(), MsbError> {
        let mut subscribed = self.subscribed.lock().await;

        let inserted = {
            let mut collectors = self.collectors();
            let correlation_id = collector.correlation_id().to_owned();

            if collectors.contains_key(&correlation_id) {
                debug!("Collector already registered");
                false
            } else {
                collectors.insert(correlation_id, collector.clone());
                true
            }
        };

        if !*subscribed {
            let resolver: Arc<dyn MessageHandlerResolver> = self.clone();

            if let Err(e) = self
                .channels
                .subscribe_for_responses(&self.topic, resolver)
                .await
            {
                if inserted {
                    self.collectors().remove(collector.correlation_id());
                }

                return Err(e);
            }

            *subscribed = true;
        }

        Ok(())
    }

    /// Stops routing replies to the conversation, unsubscribing from the topic when it was the last one.
    ///
    /// Calling this for an unknown or already removed conversation does nothing.
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn unregister(&self, correlation_id: &str) {
        let mut subscribed = self.subscribed.lock().await;

        let emptied = {
            let mut collectors = self.collectors();
            collectors.remove(correlation_id).is_some() && collectors.is_empty()
        };

        if emptied && *subscribed {
            if let Err(e) = self.channels.unsubscribe(&self.topic).await {
                warn!(error = %e, "Failed to unsubscribe from response topic");
            }

            *subscribed = false;
        }
    }
}

impl MessageHandlerResolver for CollectorManager {
    fn resolve(&self, message: &Message) -> Option<Arc<dyn MessageHandler>> {
        match self.find(&message.correlation_id) {
            Some(collector) => Some(collector),
            None => {
                debug!(topic = %self.topic, correlation_id = %message.correlation_id, "Dropping reply without ongoing conversation");
                None
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::adapter::{AdapterFactory, ConsumerAdapter, ProducerAdapter, RawMessageHandler};
    use crate::channel::{DirectInvoker, NoopChannelMonitorAgent};
    use crate::collector::{CollectorCallbacks, CollectorSettings};
    use crate::timer::TimerService;
    use crate::{BoxedError, EmptyResult};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TOPIC: &str = "test:manager:response:instance";

    #[derive(Default)]
    struct Calls {
        subscribe: AtomicUsize,
        unsubscribe: AtomicUsize,
    }

    struct CountingConsumer(Arc<Calls>);

    #[async_trait]
    impl ConsumerAdapter for CountingConsumer {
        async fn subscribe(&self, _handler: Arc<dyn RawMessageHandler>) -> EmptyResult {
            self.0.subscribe.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unsubscribe(&self) -> EmptyResult {
            self.0.unsubscribe.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory(Arc<Calls>);

    #[async_trait]
    impl AdapterFactory for CountingFactory {
        async fn create_producer_adapter(
            &self,
            _topic: &str,
        ) -> Result<Box<dyn ProducerAdapter>, BoxedError> {
            Err("producers are not supported".into())
        }

        async fn create_consumer_adapter(
            &self,
            _topic: &str,
            _is_response_topic: bool,
        ) -> Result<Box<dyn ConsumerAdapter>, BoxedError> {
            Ok(Box::new(CountingConsumer(self.0.clone())))
        }

        async fn shutdown(&self) -> EmptyResult {
            Ok(())
        }
    }

    fn manager() -> (Arc<CollectorManager>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let channels = Arc::new(ChannelManager::new(
            Arc::new(CountingFactory(calls.clone())),
            Arc::new(DirectInvoker),
            Arc::new(NoopChannelMonitorAgent),
        ));

        (CollectorManager::new(TOPIC, channels), calls)
    }

    fn collector(manager: &Arc<CollectorManager>, correlation_id: &str) -> Arc<Collector> {
        Collector::new(
            correlation_id,
            CollectorSettings::default(),
            Duration::from_secs(3),
            CollectorCallbacks::default(),
            TimerService::new(1),
            manager,
        )
    }

    #[tokio::test]
    async fn share_one_subscription() {
        let (manager, calls) = manager();
        let ids: Vec<String> = (0..5).map(|i| format!("conversation-{}", i)).collect();

        for id in &ids {
            manager.register(collector(&manager, id)).await.unwrap();
        }
        assert_eq!(calls.subscribe.load(Ordering::SeqCst), 1);

        for id in ids.iter().rev() {
            assert_eq!(calls.unsubscribe.load(Ordering::SeqCst), 0);
            manager.unregister(id).await;
        }
        assert_eq!(calls.unsubscribe.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_once_under_concurrent_removal() {
        let (manager, calls) = manager();
        let ids: Vec<String> = (0..16).map(|i| format!("conversation-{}", i)).collect();

        for id in &ids {
            manager.register(collector(&manager, id)).await.unwrap();
        }

        let removals = ids.into_iter().map(|id| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.unregister(&id).await })
        });

        for removal in futures::future::join_all(removals).await {
            removal.unwrap();
        }

        assert!(manager.is_empty());
        assert_eq!(calls.unsubscribe.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignore_repeated_unregistration() {
        let (manager, calls) = manager();

        manager.register(collector(&manager, "a")).await.unwrap();
        manager.unregister("a").await;
        manager.unregister("a").await;

        assert_eq!(calls.unsubscribe.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keep_first_collector_of_conversation() {
        let (manager, calls) = manager();
        let first = collector(&manager, "a");

        manager.register(first.clone()).await.unwrap();
        manager.register(collector(&manager, "a")).await.unwrap();

        let found = manager.find("a").unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert_eq!(calls.subscribe.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubscribe_after_becoming_empty() {
        let (manager, calls) = manager();

        manager.register(collector(&manager, "a")).await.unwrap();
        manager.unregister("a").await;
        manager.register(collector(&manager, "b")).await.unwrap();

        assert_eq!(calls.subscribe.load(Ordering::SeqCst), 2);
        assert_eq!(calls.unsubscribe.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_only_ongoing_conversations() {
        let (manager, _calls) = manager();
        manager.register(collector(&manager, "a")).await.unwrap();

        let factory = crate::message::MessageFactory::new(crate::config::MsbConfig::default().service_details());
        let mut reply = factory.create_request(
            "test:manager",
            None,
            None,
            &crate::message::MessageTemplate::default(),
        );

        reply.correlation_id = "a".into();
        assert!(manager.resolve(&reply).is_some());

        reply.correlation_id = "b".into();
        assert!(manager.resolve(&reply).is_none());
    }
}
