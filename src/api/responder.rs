use super::context::ContextShared;
use crate::channel::MessageHandler;
use crate::message::{generate_id, Acknowledge, Message, MessageTemplate};
use crate::{BoxedError, EmptyResult, MsbError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Sends acknowledgements and responses correlated to one request
#[derive(Clone)]
pub struct Responder {
    responder_id: String,
    request: Arc<Message>,
    template: MessageTemplate,
    shared: Arc<ContextShared>,
}

impl Responder {
    fn new(request: Arc<Message>, template: MessageTemplate, shared: Arc<ContextShared>) -> Self {
        Self {
            responder_id: generate_id(),
            request,
            template,
            shared,
        }
    }

    /// Identifier stamped into every acknowledgement, unique per responder
    pub fn responder_id(&self) -> &str {
        &self.responder_id
    }

    /// Request this responder replies to
    pub fn original_message(&self) -> &Message {
        &self.request
    }

    /// Announces that responses are about to follow.
    ///
    /// `timeout_ms` is the time the requester should wait for them and
    /// `responses_remaining` how many there will be.
    pub async fn send_ack(
        &self,
        timeout_ms: Option<u64>,
        responses_remaining: Option<i32>,
    ) -> Result<(), MsbError> {
        let ack = Acknowledge {
            responder_id: self.responder_id.clone(),
            responses_remaining,
            timeout_ms,
        };

        self.reply(Some(ack), None).await
    }

    /// Sends a response carrying the payload
    pub async fn send<P>(&self, payload: &P) -> Result<(), MsbError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.reply(None, Some(payload)).await
    }

    async fn reply(&self, ack: Option<Acknowledge>, payload: Option<Value>) -> Result<(), MsbError> {
        let factory = &self.shared.messages;
        let message = match factory.create_reply(&self.request, ack, payload, &self.template) {
            Some(message) => message,
            None => {
                warn!(
                    topic = %self.request.topics.to,
                    correlation_id = %self.request.correlation_id,
                    "Request does not expect replies, skipping"
                );
                return Ok(());
            }
        };

        let producer = self
            .shared
            .channels
            .find_or_create_producer(&message.topics.to)
            .await?;

        producer.publish(&message).await
    }
}

/// Everything a request handler needs to reply to a request
#[derive(Clone)]
pub struct ResponderContext {
    message: Arc<Message>,
    responder: Responder,
}

impl ResponderContext {
    /// Request as received from the bus
    pub fn original_message(&self) -> &Message {
        &self.message
    }

    /// Responder replying to the request
    pub fn responder(&self) -> &Responder {
        &self.responder
    }
}

/// Processes requests received by a [`ResponderServer`]
#[async_trait]
pub trait RequestHandler<T>: Send + Sync {
    /// Handles the request, replies are sent through the responder of the context
    async fn process(&self, request: T, context: ResponderContext) -> EmptyResult;
}

#[async_trait]
impl<T, F, Fut> RequestHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T, ResponderContext) -> Fut + Send + Sync,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    async fn process(&self, request: T, context: ResponderContext) -> EmptyResult {
        (self)(request, context).await
    }
}

/// Reacts to requests which could not be processed
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Called with the failure of a request handler or the conversion of a request.
    /// May use the responder of the context to send a fallback reply.
    async fn handle(&self, error: BoxedError, context: &ResponderContext);
}

/// Logs failures without replying
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle(&self, error: BoxedError, context: &ResponderContext) {
        let message = context.original_message();
        warn!(
            topic = %message.topics.to,
            correlation_id = %message.correlation_id,
            error = %error,
            "Failed to process request"
        );
    }
}

struct RequestDispatch<T> {
    template: MessageTemplate,
    handler: Arc<dyn RequestHandler<T>>,
    error_handler: Arc<dyn ErrorHandler>,
    shared: Arc<ContextShared>,
}

#[async_trait]
impl<T> MessageHandler for RequestDispatch<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn handle_message(&self, message: Message) -> EmptyResult {
        let payload = message.payload.clone().unwrap_or(Value::Null);
        let message = Arc::new(message);
        let context = ResponderContext {
            responder: Responder::new(message.clone(), self.template.clone(), self.shared.clone()),
            message,
        };

        let outcome = match serde_json::from_value::<T>(payload) {
            Ok(request) => self.handler.process(request, context.clone()).await,
            Err(e) => Err(MsbError::from(e).into()),
        };

        if let Err(e) = outcome {
            self.error_handler.handle(e, &context).await;
        }

        Ok(())
    }
}

/// Listens for requests of type `T` on a namespace
pub struct ResponderServer<T> {
    namespace: String,
    dispatch: Arc<RequestDispatch<T>>,
    _request: PhantomData<fn(T)>,
}

impl<T> ResponderServer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        namespace: &str,
        template: MessageTemplate,
        handler: Arc<dyn RequestHandler<T>>,
        error_handler: Arc<dyn ErrorHandler>,
        shared: Arc<ContextShared>,
    ) -> Self {
        Self {
            namespace: namespace.to_owned(),
            dispatch: Arc::new(RequestDispatch {
                template,
                handler,
                error_handler,
                shared,
            }),
            _request: PhantomData,
        }
    }

    /// Topic requests are received on
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Subscribes to the namespace. Fails if something else already listens on it within this context.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn listen(&self) -> Result<(), MsbError> {
        let handler: Arc<dyn MessageHandler> = self.dispatch.clone();
        self.dispatch
            .shared
            .channels
            .subscribe(&self.namespace, handler)
            .await?;

        info!("Listening for requests");
        Ok(())
    }

    /// Stops receiving requests
    pub async fn stop(&self) -> Result<(), MsbError> {
        self.dispatch
            .shared
            .channels
            .unsubscribe(&self.namespace)
            .await
    }
}
