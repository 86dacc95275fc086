use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// Observer of channel activity, e.g. for collecting statistics
///
/// Every method defaults to doing nothing. Implementations are invoked on the
/// publishing or dispatching task and should return quickly.
pub trait ChannelMonitorAgent: Send + Sync {
    /// A producer for the topic has been created
    fn producer_topic_created(&self, _topic: &str) {}

    /// A consumer for the topic has been subscribed
    fn consumer_topic_created(&self, _topic: &str) {}

    /// The consumer of the topic has been unsubscribed
    fn consumer_topic_removed(&self, _topic: &str) {}

    /// A message has been handed to the broker
    fn producer_message_sent(&self, _topic: &str) {}

    /// A well-formed message has been received
    fn consumer_message_received(&self, _topic: &str) {}
}

/// Agent ignoring all activity
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChannelMonitorAgent;

impl ChannelMonitorAgent for NoopChannelMonitorAgent {}

/// Replaceable agent shared by a channel manager and its producers and consumers
#[derive(Clone)]
pub(crate) struct SharedMonitor(Arc<RwLock<Arc<dyn ChannelMonitorAgent>>>);

impl SharedMonitor {
    pub fn new(agent: Arc<dyn ChannelMonitorAgent>) -> Self {
        Self(Arc::new(RwLock::new(agent)))
    }

    pub fn replace(&self, agent: Arc<dyn ChannelMonitorAgent>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = agent;
    }

    /// Invokes the current agent, panics are logged and discarded
    pub fn notify<F>(&self, notification: F)
    where
        F: FnOnce(&dyn ChannelMonitorAgent),
    {
        let agent = self.0.read().unwrap_or_else(PoisonError::into_inner).clone();

        if catch_unwind(AssertUnwindSafe(|| notification(agent.as_ref()))).is_err() {
            error!("Channel monitor agent panicked");
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAgent(AtomicUsize);

    impl ChannelMonitorAgent for CountingAgent {
        fn producer_message_sent(&self, _topic: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingAgent;

    impl ChannelMonitorAgent for PanickingAgent {
        fn producer_message_sent(&self, _topic: &str) {
            panic!("agent failure");
        }
    }

    #[test]
    fn swap_agents() {
        let counting = Arc::new(CountingAgent::default());
        let monitor = SharedMonitor::new(Arc::new(NoopChannelMonitorAgent));

        monitor.notify(|agent| agent.producer_message_sent("test:topic"));
        monitor.replace(counting.clone());
        monitor.notify(|agent| agent.producer_message_sent("test:topic"));

        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contain_agent_panics() {
        let monitor = SharedMonitor::new(Arc::new(PanickingAgent));
        monitor.notify(|agent| agent.producer_message_sent("test:topic"));
        monitor.notify(|agent| agent.consumer_message_received("test:topic"));
    }
}
