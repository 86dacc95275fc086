use super::{Acknowledge, Message, MetaMessage, Topics};
use crate::config::ServiceDetails;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

/// Values applied to every message created with it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageTemplate {
    ttl: Option<u64>,
    tags: Vec<String>,
}

impl MessageTemplate {
    /// Creates an empty template
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime in milliseconds after which receivers discard messages
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    /// Labels attached to each message
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Configured lifetime in milliseconds
    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    /// Configured labels
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

/// Builds envelopes stamped with the identity of this instance
#[derive(Debug, Clone)]
pub struct MessageFactory {
    service_details: ServiceDetails,
}

impl MessageFactory {
    /// Creates a new factory for the given service identity
    pub fn new(service_details: ServiceDetails) -> Self {
        Self { service_details }
    }

    /// Identity stamped into created messages
    pub fn service_details(&self) -> &ServiceDetails {
        &self.service_details
    }

    /// Creates a request starting a new conversation with a fresh correlation id
    pub fn create_request(
        &self,
        topic: &str,
        response_topic: Option<String>,
        payload: Option<Value>,
        template: &MessageTemplate,
    ) -> Message {
        Message {
            id: generate_id(),
            correlation_id: generate_id(),
            topics: Topics {
                to: topic.to_owned(),
                response: response_topic,
            },
            meta: self.meta(template),
            tags: template.tags().to_vec(),
            payload,
            ack: None,
        }
    }

    /// Creates a reply correlated to the given request.
    ///
    /// Returns `None` if the request does not expect any replies.
    pub fn create_reply(
        &self,
        request: &Message,
        ack: Option<Acknowledge>,
        payload: Option<Value>,
        template: &MessageTemplate,
    ) -> Option<Message> {
        let to = request.topics.response.clone()?;

        Some(Message {
            id: generate_id(),
            correlation_id: request.correlation_id.clone(),
            topics: Topics { to, response: None },
            meta: self.meta(template),
            tags: template.tags().to_vec(),
            payload,
            ack,
        })
    }

    fn meta(&self, template: &MessageTemplate) -> MetaMessage {
        MetaMessage {
            service_details: self.service_details.clone(),
            created_at: Utc::now(),
            ttl: template.ttl(),
            duration_ms: None,
        }
    }
}

/// Generates a unique identifier for messages, conversations and responders
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
