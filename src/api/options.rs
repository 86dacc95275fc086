use crate::collector::CollectorSettings;
use crate::message::MessageTemplate;
use std::time::Duration;

/// Expectations of a requester towards the replies to its requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    ack_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    wait_for_responses: Option<i32>,
    message_template: MessageTemplate,
}

impl RequestOptions {
    /// Creates options which rely on configured defaults only
    pub fn new() -> Self {
        Self::default()
    }

    /// Time within which at least one responder has to acknowledge a request
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Time within which all responses have to arrive
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Number of responses after which a conversation ends early.
    ///
    /// Zero without an ack timeout turns the requester into a fire and forget publisher.
    pub fn with_wait_for_responses(mut self, responses: i32) -> Self {
        self.wait_for_responses = Some(responses);
        self
    }

    /// Template applied to every published request
    pub fn with_message_template(mut self, template: MessageTemplate) -> Self {
        self.message_template = template;
        self
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub fn wait_for_responses(&self) -> Option<i32> {
        self.wait_for_responses
    }

    pub fn message_template(&self) -> &MessageTemplate {
        &self.message_template
    }

    /// Whether requests are published without awaiting any replies.
    ///
    /// An acknowledgement timeout, either set on the options or configured as the default,
    /// still requires collecting the replies.
    pub fn is_fire_and_forget(&self, default_ack_timeout: Option<Duration>) -> bool {
        self.wait_for_responses == Some(0)
            && self.ack_timeout.or(default_ack_timeout).is_none()
    }

    /// Expectations handed to the collector of each conversation.
    ///
    /// Every conversation needs at least one timer to end, the response timeout falls
    /// back to `default_response_timeout` if neither timeout is known.
    pub(crate) fn collector_settings(
        &self,
        default_ack_timeout: Option<Duration>,
        default_response_timeout: Duration,
    ) -> CollectorSettings {
        let ack_timeout = self.ack_timeout.or(default_ack_timeout);
        let response_timeout = match (self.response_timeout, ack_timeout) {
            (None, None) => Some(default_response_timeout),
            (timeout, _) => timeout,
        };

        CollectorSettings {
            ack_timeout,
            response_timeout,
            responses_remaining: self.wait_for_responses,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detect_fire_and_forget() {
        assert!(RequestOptions::new().with_wait_for_responses(0).is_fire_and_forget(None));
        assert!(!RequestOptions::new().is_fire_and_forget(None));
        assert!(!RequestOptions::new()
            .with_wait_for_responses(0)
            .with_ack_timeout(Duration::from_millis(100))
            .is_fire_and_forget(None));
    }

    #[test]
    fn collect_when_default_ack_timeout_is_configured() {
        let options = RequestOptions::new().with_wait_for_responses(0);
        let default_ack_timeout = Some(Duration::from_millis(100));

        assert!(!options.is_fire_and_forget(default_ack_timeout));
        assert_eq!(
            options
                .collector_settings(default_ack_timeout, Duration::from_secs(3))
                .ack_timeout,
            default_ack_timeout
        );
    }

    #[test]
    fn fall_back_to_default_response_timeout() {
        let settings = RequestOptions::new()
            .with_wait_for_responses(1)
            .collector_settings(None, Duration::from_secs(3));

        assert_eq!(
            settings,
            CollectorSettings {
                ack_timeout: None,
                response_timeout: Some(Duration::from_secs(3)),
                responses_remaining: Some(1),
            }
        );
    }

    #[test]
    fn keep_explicit_timeouts() {
        let settings = RequestOptions::new()
            .with_ack_timeout(Duration::from_millis(100))
            .collector_settings(Some(Duration::from_millis(50)), Duration::from_secs(3));

        assert_eq!(settings.ack_timeout, Some(Duration::from_millis(100)));
        assert_eq!(settings.response_timeout, None);
        assert_eq!(settings.responses_remaining, None);
    }
}
