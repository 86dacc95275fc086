use crate::config::ServiceDetails;
use crate::MsbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Destination and reply location of a message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Topics {
    /// Topic the message is published on
    pub to: String,
    /// Topic on which replies are expected, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Metadata describing the origin and lifetime of a message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaMessage {
    /// Identity of the publishing service
    pub service_details: ServiceDetails,
    /// Point in time at which the message was created
    pub created_at: DateTime<Utc>,
    /// Lifetime in milliseconds after which receivers discard the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Time in milliseconds the message spent in transit, filled in by the receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl MetaMessage {
    /// Whether the lifetime of the message has passed at the given instant.
    ///
    /// A lifetime reaching beyond the representable range never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let expiry = self
            .ttl
            .and_then(|ttl| i64::try_from(ttl).ok())
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));

        expiry.map_or(false, |expiry| expiry < now)
    }
}

/// Acknowledgement sent by a responder upon accepting a request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledge {
    /// Identifier of the responder, unique per responder instance
    pub responder_id: String,
    /// Number of responses the responder is about to send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses_remaining: Option<i32>,
    /// Time in milliseconds within which the remaining responses will be sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Envelope of everything sent over the bus
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier of this envelope
    pub id: String,
    /// Identifier shared by a request and all its replies
    pub correlation_id: String,
    /// Destination of the message
    pub topics: Topics,
    /// Origin and lifetime information
    pub meta: MetaMessage,
    /// Free-form labels copied from the message template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Opaque body of the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Acknowledgement information, only present on replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Acknowledge>,
}

impl Message {
    /// Parses a message from its wire format
    pub fn from_json(data: &[u8]) -> Result<Self, MsbError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Serializes the message into its wire format
    pub fn to_json(&self) -> Result<String, MsbError> {
        Ok(serde_json::to_string(self)?)
    }

    /// A reply which only acknowledges the request without carrying a response
    pub fn is_pure_ack(&self) -> bool {
        self.ack.is_some() && self.payload.is_none()
    }

    /// A reply carrying a response payload
    pub fn is_response(&self) -> bool {
        self.payload.is_some()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn meta() -> MetaMessage {
        MetaMessage {
            service_details: ServiceDetails {
                name: "test".into(),
                version: "1.0.0".into(),
                instance_id: "instance".into(),
            },
            created_at: Utc::now(),
            ttl: None,
            duration_ms: None,
        }
    }

    #[test]
    fn use_wire_field_names() {
        let message = Message {
            id: "id".into(),
            correlation_id: "correlation".into(),
            topics: Topics {
                to: "test:topic".into(),
                response: Some("test:topic:response:instance".into()),
            },
            meta: meta(),
            tags: Vec::new(),
            payload: None,
            ack: Some(Acknowledge {
                responder_id: "responder".into(),
                responses_remaining: Some(2),
                timeout_ms: Some(100),
            }),
        };

        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["correlationId"], json!("correlation"));
        assert_eq!(value["topics"]["response"], json!("test:topic:response:instance"));
        assert_eq!(value["meta"]["serviceDetails"]["instanceId"], json!("instance"));
        assert_eq!(value["ack"]["responderId"], json!("responder"));
        assert_eq!(value["ack"]["responsesRemaining"], json!(2));
        assert_eq!(value["ack"]["timeoutMs"], json!(100));
        assert!(value.get("payload").is_none());
        assert!(value.get("tags").is_none());
        assert!(message.is_pure_ack());
    }

    #[test]
    fn accept_minimal_envelope() {
        let raw = json!({
            "id": "1",
            "correlationId": "2",
            "topics": { "to": "test:topic" },
            "meta": {
                "serviceDetails": { "name": "a", "version": "b", "instanceId": "c" },
                "createdAt": "2020-01-01T00:00:00Z"
            },
            "payload": { "body": "hello" }
        });

        let message = Message::from_json(raw.to_string().as_bytes()).unwrap();

        assert_eq!(message.topics.response, None);
        assert!(message.is_response());
        assert!(!message.is_pure_ack());
    }

    #[test]
    fn reject_missing_correlation_id() {
        let raw = json!({
            "id": "1",
            "topics": { "to": "test:topic" },
            "meta": {
                "serviceDetails": { "name": "a", "version": "b", "instanceId": "c" },
                "createdAt": "2020-01-01T00:00:00Z"
            }
        });

        assert!(Message::from_json(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn expire_after_ttl() {
        let mut meta = meta();
        let created_at = meta.created_at;

        assert!(!meta.is_expired_at(created_at + chrono::Duration::days(365)));

        meta.ttl = Some(1000);
        assert!(!meta.is_expired_at(created_at + chrono::Duration::milliseconds(500)));
        assert!(meta.is_expired_at(created_at + chrono::Duration::milliseconds(1500)));
    }

    #[test]
    fn never_expire_beyond_representable_time() {
        let mut meta = meta();
        let created_at = meta.created_at;

        for ttl in &[i64::MAX as u64, u64::MAX] {
            meta.ttl = Some(*ttl);
            assert!(!meta.is_expired_at(created_at + chrono::Duration::days(365)));
        }
    }
}
