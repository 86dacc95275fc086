use crate::MsbError;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TOPIC_PATTERN: Regex =
        Regex::new(r"^_?([a-z0-9\-]+:)+[a-z0-9\-]+$").expect("topic pattern is valid");
}

/// Ensures a topic name consists of at least two colon separated segments of `[a-z0-9-]`
pub fn validate_topic(topic: &str) -> Result<(), MsbError> {
    if TOPIC_PATTERN.is_match(topic) {
        Ok(())
    } else {
        Err(MsbError::Configuration(format!(
            "topic '{}' does not match {}",
            topic,
            TOPIC_PATTERN.as_str()
        )))
    }
}

/// Topic on which an instance receives replies to requests sent to `topic`
pub fn response_topic(topic: &str, instance_id: &str) -> String {
    format!("{}:response:{}", topic, instance_id)
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn accept_namespaced_topics() {
        assert!(validate_topic("test:general").is_ok());
        assert!(validate_topic("pingpong:namespace").is_ok());
        assert!(validate_topic("_internal:stats:v2").is_ok());
        assert!(validate_topic("test:aggregator:response:0f8fad5b-d9cb-469f-a165-70867728950e").is_ok());
    }

    #[test]
    fn reject_malformed_topics() {
        assert!(validate_topic("").is_err());
        assert!(validate_topic("single").is_err());
        assert!(validate_topic("Upper:case").is_err());
        assert!(validate_topic("trailing:").is_err());
        assert!(validate_topic("with space:topic").is_err());
    }

    #[test]
    fn derive_response_topic() {
        assert_eq!(
            response_topic("test:ping", "instance-1"),
            "test:ping:response:instance-1"
        );
        assert!(validate_topic(&response_topic("test:ping", "instance-1")).is_ok());
    }
}
