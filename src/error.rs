use crate::BoxedError;
use thiserror::Error;

/// Failures surfaced synchronously to callers of the bus
///
/// Message level problems (malformed envelopes, failing handlers, late replies) are
/// never reported through this type. They are logged at the dispatch boundary and
/// only become visible as a conversation ending before all expected responses arrived.
#[derive(Error, Debug)]
pub enum MsbError {
    /// Invalid topic names, missing required values and similar programming errors
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The transport adapter failed to publish, subscribe or unsubscribe
    #[error("channel failure on topic {topic}")]
    Channel {
        /// Topic the failing operation was executed on
        topic: String,
        /// Error reported by the adapter
        #[source]
        source: BoxedError,
    },
    /// A subscriber is already active on the topic
    #[error("subscriber for topic {0} already exists")]
    ConsumerSubscription(String),
    /// A message or payload could not be converted from or to JSON
    #[error("unable to convert message")]
    JsonConversion(#[from] serde_json::Error),
}

impl MsbError {
    pub(crate) fn channel<E: Into<BoxedError>>(topic: &str, source: E) -> Self {
        Self::Channel {
            topic: topic.to_owned(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::error::Error;

    #[test]
    fn retain_channel_cause() {
        let cause: BoxedError = "connection reset".into();
        let error = MsbError::channel("test:topic", cause);

        assert_eq!(error.to_string(), "channel failure on topic test:topic");
        assert_eq!(
            error.source().map(|s| s.to_string()),
            Some("connection reset".to_string())
        );
    }

    #[test]
    fn name_duplicate_topic() {
        let error = MsbError::ConsumerSubscription("test:topic".into());
        assert_eq!(
            error.to_string(),
            "subscriber for topic test:topic already exists"
        );
    }
}
