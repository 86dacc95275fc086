use super::monitor::SharedMonitor;
use crate::adapter::ProducerAdapter;
use crate::message::Message;
use crate::MsbError;
use tracing::{instrument, trace};

/// Outbound side of a topic, shared by everybody publishing on it
pub struct Producer {
    topic: String,
    adapter: Box<dyn ProducerAdapter>,
    monitor: SharedMonitor,
}

impl Producer {
    pub(crate) fn new(topic: &str, adapter: Box<dyn ProducerAdapter>, monitor: SharedMonitor) -> Self {
        Self {
            topic: topic.to_owned(),
            adapter,
            monitor,
        }
    }

    /// Topic this producer publishes on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serializes the message and hands it to the broker.
    ///
    /// Serialization and transport failures are both reported as [`MsbError::Channel`]
    /// and never retried.
    #[instrument(level = "trace", skip(self, message), fields(topic = %self.topic, correlation_id = %message.correlation_id))]
    pub async fn publish(&self, message: &Message) -> Result<(), MsbError> {
        let serialized =
            serde_json::to_vec(message).map_err(|e| MsbError::channel(&self.topic, e))?;

        self.adapter
            .publish(&serialized)
            .await
            .map_err(|e| MsbError::channel(&self.topic, e))?;

        trace!("Published message");
        self.monitor
            .notify(|agent| agent.producer_message_sent(&self.topic));

        Ok(())
    }
}
