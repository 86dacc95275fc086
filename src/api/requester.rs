use super::context::ContextShared;
use super::RequestOptions;
use crate::collector::{
    AckCallback, Collector, CollectorCallbacks, ConversationEnd, EndCallback, ResponseCallback,
};
use crate::message::{response_topic, Acknowledge, Message};
use crate::MsbError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

type TypedResponseCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Publishes requests on a namespace and collects the replies of type `T`
///
/// Every call to [`publish`](Self::publish) starts a new conversation with its own
/// correlation id. The callbacks registered on the requester are shared by all of
/// its conversations and run on a runtime worker task, not on the publishing task.
pub struct Requester<T> {
    namespace: String,
    response_topic: String,
    options: RequestOptions,
    shared: Arc<ContextShared>,
    on_acknowledge: Option<AckCallback>,
    on_response: Option<TypedResponseCallback<T>>,
    on_raw_response: Option<ResponseCallback>,
    on_end: Option<EndCallback>,
    _response: PhantomData<fn() -> T>,
}

impl<T> Requester<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(namespace: &str, options: RequestOptions, shared: Arc<ContextShared>) -> Self {
        let response_topic =
            response_topic(namespace, &shared.messages.service_details().instance_id);

        Self {
            namespace: namespace.to_owned(),
            response_topic,
            options,
            shared,
            on_acknowledge: None,
            on_response: None,
            on_raw_response: None,
            on_end: None,
            _response: PhantomData,
        }
    }

    /// Topic requests are published on
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Topic replies are received on
    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    /// Called for every acknowledgement received
    pub fn on_acknowledge<F>(mut self, callback: F) -> Self
    where
        F: Fn(Acknowledge) + Send + Sync + 'static,
    {
        self.on_acknowledge = Some(Arc::new(move |ack: &Acknowledge| callback(ack.clone())));
        self
    }

    /// Called for every response whose payload converts into `T`
    pub fn on_response<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_response = Some(Arc::new(callback));
        self
    }

    /// Called for every response with the complete reply
    pub fn on_raw_response<F>(mut self, callback: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_raw_response = Some(Arc::new(move |message: &Message| callback(message.clone())));
        self
    }

    /// Called once per conversation when it ends
    pub fn on_end<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConversationEnd) + Send + Sync + 'static,
    {
        self.on_end = Some(Arc::new(move |end: &ConversationEnd| callback(end.clone())));
        self
    }

    fn response_callback(&self) -> Option<ResponseCallback> {
        if self.on_response.is_none() && self.on_raw_response.is_none() {
            return None;
        }

        let typed = self.on_response.clone();
        let raw = self.on_raw_response.clone();

        Some(Arc::new(move |message: &Message| {
            if let Some(raw) = &raw {
                raw(message);
            }

            if let (Some(typed), Some(payload)) = (&typed, &message.payload) {
                match serde_json::from_value::<T>(payload.clone()) {
                    Ok(response) => typed(response),
                    Err(e) => warn!(
                        correlation_id = %message.correlation_id,
                        error = %e,
                        "Skipping response which is not a valid {}",
                        type_name::<T>()
                    ),
                }
            }
        }))
    }

    fn callbacks(&self) -> CollectorCallbacks {
        CollectorCallbacks {
            on_acknowledge: self.on_acknowledge.clone(),
            on_response: self.response_callback(),
            on_end: self.on_end.clone(),
        }
    }

    /// Publishes a request and returns the correlation id of the started conversation.
    ///
    /// Replies are collected in the background. Errors are only returned if the request
    /// could not be published, in which case no callback is invoked for it.
    #[instrument(skip(self, payload), fields(namespace = %self.namespace))]
    pub async fn publish<P>(&self, payload: &P) -> Result<String, MsbError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        let template = self.options.message_template();
        let producer = self
            .shared
            .channels
            .find_or_create_producer(&self.namespace)
            .await?;

        let config = &self.shared.config;
        let default_ack_timeout = config.default_ack_timeout_ms.map(Duration::from_millis);

        if self.options.is_fire_and_forget(default_ack_timeout) {
            let message = self
                .shared
                .messages
                .create_request(&self.namespace, None, Some(payload), template);

            producer.publish(&message).await?;
            debug!(correlation_id = %message.correlation_id, "Published request without awaiting replies");

            return Ok(message.correlation_id);
        }

        let message = self.shared.messages.create_request(
            &self.namespace,
            Some(self.response_topic.clone()),
            Some(payload),
            template,
        );

        let settings = self
            .options
            .collector_settings(default_ack_timeout, config.default_response_timeout());

        let manager = self.shared.collector_manager(&self.response_topic);
        let collector = Collector::new(
            &message.correlation_id,
            settings,
            config.default_response_timeout(),
            self.callbacks(),
            self.shared.timers.clone(),
            &manager,
        );

        manager.register(collector.clone()).await?;
        collector.start().await;

        if let Err(e) = producer.publish(&message).await {
            collector.abandon().await;
            return Err(e);
        }

        debug!(correlation_id = %message.correlation_id, "Published request");
        Ok(message.correlation_id)
    }
}
