use super::invoker::MessageHandlerInvoker;
use super::monitor::SharedMonitor;
use crate::adapter::{ConsumerAdapter, RawMessageHandler};
use crate::message::Message;
use crate::{EmptyResult, MsbError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Processes well-formed inbound messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles a single message. Errors are logged by the dispatcher.
    async fn handle_message(&self, message: Message) -> EmptyResult;
}

/// Picks the handler responsible for an inbound message
pub trait MessageHandlerResolver: Send + Sync {
    /// Returns `None` if nobody is interested in the message anymore
    fn resolve(&self, message: &Message) -> Option<Arc<dyn MessageHandler>>;
}

/// Resolver handing every message to the same handler
pub struct FixedHandlerResolver(pub Arc<dyn MessageHandler>);

impl MessageHandlerResolver for FixedHandlerResolver {
    fn resolve(&self, _message: &Message) -> Option<Arc<dyn MessageHandler>> {
        Some(self.0.clone())
    }
}

/// Turns raw deliveries into handler invocations
struct Dispatcher {
    topic: String,
    resolver: Arc<dyn MessageHandlerResolver>,
    invoker: Arc<dyn MessageHandlerInvoker>,
    monitor: SharedMonitor,
}

impl Dispatcher {
    fn accept(&self, raw: &[u8]) -> Option<Message> {
        let mut message = match Message::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Dropping malformed message");
                return None;
            }
        };

        if message.id.is_empty() || message.correlation_id.is_empty() {
            warn!(topic = %self.topic, "Dropping message without id or correlation id");
            return None;
        }

        let now = Utc::now();
        if message.meta.is_expired_at(now) {
            warn!(topic = %self.topic, id = %message.id, "Dropping expired message");
            return None;
        }

        let elapsed = (now - message.meta.created_at).num_milliseconds();
        message.meta.duration_ms = Some(u64::try_from(elapsed).unwrap_or(0));

        Some(message)
    }
}

#[async_trait]
impl RawMessageHandler for Dispatcher {
    async fn handle(&self, raw: Vec<u8>) {
        let message = match self.accept(&raw) {
            Some(message) => message,
            None => return,
        };

        self.monitor
            .notify(|agent| agent.consumer_message_received(&self.topic));

        let handler = match self.resolver.resolve(&message) {
            Some(handler) => handler,
            None => {
                debug!(topic = %self.topic, correlation_id = %message.correlation_id, "No handler for message, dropping it");
                return;
            }
        };

        let topic = self.topic.clone();
        self.invoker
            .execute(&self.topic, Box::pin(async move {
                let id = message.id.clone();
                if let Err(e) = handler.handle_message(message).await {
                    warn!(topic = %topic, id = %id, error = %e, "Message handler failed");
                }
            }))
            .await;
    }
}

/// Inbound side of a topic
pub struct Consumer {
    topic: String,
    adapter: Box<dyn ConsumerAdapter>,
    dispatcher: Arc<Dispatcher>,
}

impl Consumer {
    pub(crate) fn new(
        topic: &str,
        adapter: Box<dyn ConsumerAdapter>,
        resolver: Arc<dyn MessageHandlerResolver>,
        invoker: Arc<dyn MessageHandlerInvoker>,
        monitor: SharedMonitor,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            adapter,
            dispatcher: Arc::new(Dispatcher {
                topic: topic.to_owned(),
                resolver,
                invoker,
                monitor,
            }),
        }
    }

    /// Topic this consumer receives from
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) async fn subscribe(&self) -> Result<(), MsbError> {
        self.adapter
            .subscribe(self.dispatcher.clone())
            .await
            .map_err(|e| MsbError::channel(&self.topic, e))
    }

    pub(crate) async fn end(&self) -> Result<(), MsbError> {
        self.adapter
            .unsubscribe()
            .await
            .map_err(|e| MsbError::channel(&self.topic, e))
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::channel::invoker::DirectInvoker;
    use crate::channel::monitor::{ChannelMonitorAgent, NoopChannelMonitorAgent};
    use crate::config::ServiceDetails;
    use crate::message::{MessageFactory, MessageTemplate};
    use futures::lock::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHandler(Mutex<Vec<Message>>);

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle_message(&self, message: Message) -> EmptyResult {
            self.0.lock().await.push(message);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle_message(&self, _message: Message) -> EmptyResult {
            Err("handler failure".into())
        }
    }

    #[derive(Default)]
    struct CountingAgent(AtomicUsize);

    impl ChannelMonitorAgent for CountingAgent {
        fn consumer_message_received(&self, _topic: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dispatcher(handler: Arc<dyn MessageHandler>, agent: Arc<dyn ChannelMonitorAgent>) -> Dispatcher {
        Dispatcher {
            topic: "test:topic".into(),
            resolver: Arc::new(FixedHandlerResolver(handler)),
            invoker: Arc::new(DirectInvoker),
            monitor: SharedMonitor::new(agent),
        }
    }

    fn message(template: &MessageTemplate) -> Message {
        MessageFactory::new(ServiceDetails {
            name: "test".into(),
            version: "1.0.0".into(),
            instance_id: "instance".into(),
        })
        .create_request("test:topic", None, Some(serde_json::json!("hello")), template)
    }

    #[tokio::test]
    async fn deliver_well_formed_messages() {
        let handler = Arc::new(RecordingHandler::default());
        let agent = Arc::new(CountingAgent::default());
        let dispatcher = dispatcher(handler.clone(), agent.clone());
        let sent = message(&MessageTemplate::default());

        dispatcher.handle(sent.to_json().unwrap().into_bytes()).await;

        let received = handler.0.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].correlation_id, sent.correlation_id);
        assert!(received[0].meta.duration_ms.is_some());
        assert_eq!(agent.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_malformed_messages() {
        let handler = Arc::new(RecordingHandler::default());
        let agent = Arc::new(CountingAgent::default());
        let dispatcher = dispatcher(handler.clone(), agent.clone());

        dispatcher.handle(b"{ not json".to_vec()).await;

        let mut sent = message(&MessageTemplate::default());
        sent.correlation_id = String::new();
        dispatcher.handle(sent.to_json().unwrap().into_bytes()).await;

        assert!(handler.0.lock().await.is_empty());
        assert_eq!(agent.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drop_expired_messages() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher(handler.clone(), Arc::new(NoopChannelMonitorAgent));

        let mut sent = message(&MessageTemplate::new().with_ttl(10));
        sent.meta.created_at = sent.meta.created_at - chrono::Duration::seconds(1);
        dispatcher.handle(sent.to_json().unwrap().into_bytes()).await;

        assert!(handler.0.lock().await.is_empty());
    }

    #[tokio::test]
    async fn keep_delivering_after_unbounded_lifetimes() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher(handler.clone(), Arc::new(NoopChannelMonitorAgent));

        let unbounded = message(&MessageTemplate::new().with_ttl(i64::MAX as u64));
        let regular = message(&MessageTemplate::default());

        dispatcher.handle(unbounded.to_json().unwrap().into_bytes()).await;
        dispatcher.handle(regular.to_json().unwrap().into_bytes()).await;

        let received: Vec<String> = handler
            .0
            .lock()
            .await
            .iter()
            .map(|message| message.id.clone())
            .collect();

        assert_eq!(received, vec![unbounded.id, regular.id]);
    }

    #[tokio::test]
    async fn survive_failing_handlers() {
        let dispatcher = dispatcher(Arc::new(FailingHandler), Arc::new(NoopChannelMonitorAgent));
        let sent = message(&MessageTemplate::default());

        dispatcher.handle(sent.to_json().unwrap().into_bytes()).await;
        dispatcher.handle(sent.to_json().unwrap().into_bytes()).await;
    }
}
