use super::{
    ErrorHandler, LoggingErrorHandler, RequestHandler, RequestOptions, Requester, ResponderServer,
};
use crate::adapter::AdapterFactory;
use crate::channel::{
    ChannelManager, ChannelMonitorAgent, DirectInvoker, MessageHandlerInvoker,
    NoopChannelMonitorAgent, ThreadPoolInvoker,
};
use crate::collector::CollectorManager;
use crate::config::{MsbConfig, ServiceDetails};
use crate::message::{validate_topic, MessageFactory, MessageTemplate};
use crate::timer::TimerService;
use crate::MsbError;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument};

/// Collaborators shared by every requester and responder of a context
pub(crate) struct ContextShared {
    pub config: MsbConfig,
    pub channels: Arc<ChannelManager>,
    pub timers: TimerService,
    pub messages: MessageFactory,
    collector_managers: Mutex<HashMap<String, Arc<CollectorManager>>>,
}

impl ContextShared {
    /// Manager of the given response topic, created on first use
    pub fn collector_manager(&self, topic: &str) -> Arc<CollectorManager> {
        self.collector_managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_owned())
            .or_insert_with(|| CollectorManager::new(topic, self.channels.clone()))
            .clone()
    }
}

/// Assembles a [`MsbContext`]
#[derive(Default)]
pub struct MsbContextBuilder {
    config: MsbConfig,
    adapter_factory: Option<Arc<dyn AdapterFactory>>,
    monitor_agent: Option<Arc<dyn ChannelMonitorAgent>>,
}

impl MsbContextBuilder {
    /// Creates a builder using the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MsbConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used by the context, required
    pub fn with_adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.adapter_factory = Some(factory);
        self
    }

    pub fn with_monitor_agent(mut self, agent: Arc<dyn ChannelMonitorAgent>) -> Self {
        self.monitor_agent = Some(agent);
        self
    }

    /// Validates the configuration and wires up the context
    pub fn build(self) -> Result<MsbContext, MsbError> {
        self.config.validate()?;

        let factory = self
            .adapter_factory
            .ok_or_else(|| MsbError::Configuration("no adapter factory provided".into()))?;

        let invoker: Arc<dyn MessageHandlerInvoker> = match self.config.consumer_thread_pool_size
        {
            Some(size) => Arc::new(ThreadPoolInvoker::new(size)),
            None => Arc::new(DirectInvoker),
        };

        let monitor = self
            .monitor_agent
            .unwrap_or_else(|| Arc::new(NoopChannelMonitorAgent));

        let service_details = self.config.service_details();
        info!(
            service = %service_details.name,
            instance_id = %service_details.instance_id,
            "Created bus context"
        );

        Ok(MsbContext {
            shared: Arc::new(ContextShared {
                channels: Arc::new(ChannelManager::new(factory, invoker, monitor)),
                timers: TimerService::new(self.config.timer_thread_pool_size),
                messages: MessageFactory::new(service_details),
                collector_managers: Mutex::new(HashMap::new()),
                config: self.config,
            }),
        })
    }
}

/// Entry point for applications, creates requesters and responders sharing one transport
///
/// Must be created and used from within a tokio runtime.
pub struct MsbContext {
    shared: Arc<ContextShared>,
}

impl MsbContext {
    /// Configuration the context was built with
    pub fn config(&self) -> &MsbConfig {
        &self.shared.config
    }

    /// Identity stamped into every message published through this context
    pub fn service_details(&self) -> &ServiceDetails {
        self.shared.messages.service_details()
    }

    /// Registry of producers and consumers of this context
    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.shared.channels
    }

    /// Replaces the agent observing channel activity
    pub fn set_monitor_agent(&self, agent: Arc<dyn ChannelMonitorAgent>) {
        self.shared.channels.set_monitor_agent(agent);
    }

    /// Creates a requester publishing on `namespace` and collecting replies of type `T`
    pub fn create_requester<T>(
        &self,
        namespace: &str,
        options: RequestOptions,
    ) -> Result<Requester<T>, MsbError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        validate_topic(namespace)?;
        Ok(Requester::new(namespace, options, self.shared.clone()))
    }

    /// Creates a requester waiting for a single response within the default response timeout
    pub fn create_requester_for_single_response<T>(
        &self,
        namespace: &str,
    ) -> Result<Requester<T>, MsbError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let options = RequestOptions::new()
            .with_wait_for_responses(1)
            .with_response_timeout(self.shared.config.default_response_timeout());

        self.create_requester(namespace, options)
    }

    /// Creates a requester which publishes without awaiting any reply
    pub fn create_requester_for_fire_and_forget<T>(
        &self,
        namespace: &str,
    ) -> Result<Requester<T>, MsbError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.create_requester(namespace, RequestOptions::new().with_wait_for_responses(0))
    }

    /// Creates a server passing requests on `namespace` to the handler, failures are logged
    pub fn create_responder_server<T, H>(
        &self,
        namespace: &str,
        template: MessageTemplate,
        handler: H,
    ) -> Result<ResponderServer<T>, MsbError>
    where
        T: DeserializeOwned + Send + 'static,
        H: RequestHandler<T> + 'static,
    {
        self.create_responder_server_with_error_handler(
            namespace,
            template,
            handler,
            LoggingErrorHandler,
        )
    }

    /// Creates a server passing requests on `namespace` to the handler and failures to the error handler
    pub fn create_responder_server_with_error_handler<T, H, E>(
        &self,
        namespace: &str,
        template: MessageTemplate,
        handler: H,
        error_handler: E,
    ) -> Result<ResponderServer<T>, MsbError>
    where
        T: DeserializeOwned + Send + 'static,
        H: RequestHandler<T> + 'static,
        E: ErrorHandler + 'static,
    {
        validate_topic(namespace)?;

        Ok(ResponderServer::new(
            namespace,
            template,
            Arc::new(handler),
            Arc::new(error_handler),
            self.shared.clone(),
        ))
    }

    /// Releases every subscription, adapter and worker pool of the context
    #[instrument(skip(self), fields(instance_id = %self.service_details().instance_id))]
    pub async fn shutdown(&self) {
        self.shared.channels.shutdown().await;
        self.shared.timers.shutdown();
        info!("Bus context shut down");
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::adapter::memory::{InMemoryAdapterFactory, InMemoryBroker};
    use crate::config::BrokerOptions;

    fn factory() -> Arc<dyn AdapterFactory> {
        Arc::new(InMemoryAdapterFactory::new(
            InMemoryBroker::new(),
            BrokerOptions::default(),
        ))
    }

    #[test]
    fn require_adapter_factory() {
        assert!(matches!(
            MsbContextBuilder::new().build(),
            Err(MsbError::Configuration(_))
        ));
    }

    #[test]
    fn reject_invalid_configuration() {
        let config = MsbConfig {
            timer_thread_pool_size: 0,
            ..Default::default()
        };

        let result = MsbContextBuilder::new()
            .with_config(config)
            .with_adapter_factory(factory())
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn reject_invalid_namespaces() {
        let context = MsbContextBuilder::new()
            .with_adapter_factory(factory())
            .build()
            .unwrap();

        assert!(context
            .create_requester::<String>("not a topic", RequestOptions::new())
            .is_err());
        assert!(context
            .create_responder_server::<String, _>(
                "Invalid",
                MessageTemplate::default(),
                |_request: String, _context: crate::ResponderContext| async {
                    Ok::<(), crate::BoxedError>(())
                },
            )
            .is_err());
    }

    #[test]
    fn share_collector_managers_per_topic() {
        let context = MsbContextBuilder::new()
            .with_adapter_factory(factory())
            .build()
            .unwrap();

        let first = context.shared.collector_manager("test:topic:response:a");
        let second = context.shared.collector_manager("test:topic:response:a");
        let other = context.shared.collector_manager("test:other:response:a");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
