//! Configuration consumed by the bus
//!
//! The structs in this module derive [`StructOpt`] so that applications may flatten
//! them into their own options struct. Every value can be provided through an
//! environment variable as well which allows for a unified configuration of all
//! services using the bus.

use crate::MsbError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use structopt::StructOpt;
use uuid::Uuid;

const DEFAULT_SERVICE_NAME: &str = "msb";
const DEFAULT_SERVICE_VERSION: &str = "1.0.0";
const DEFAULT_TIMER_THREADS: usize = 2;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Options for the bus client
#[derive(Debug, Clone, StructOpt)]
pub struct MsbConfig {
    /// Name of the service, stamped into every published message
    #[structopt(
        long = "service-name",
        env = "MSB_SERVICE_NAME",
        default_value = "msb",
        value_name = "name"
    )]
    pub service_name: String,

    /// Version of the service, stamped into every published message
    #[structopt(
        long = "service-version",
        env = "MSB_SERVICE_VERSION",
        default_value = "1.0.0",
        value_name = "version"
    )]
    pub service_version: String,

    /// Unique identifier of this instance.
    ///
    /// Used to derive the topics on which responses are received.
    /// A random identifier is generated when it is omitted.
    #[structopt(long = "instance-id", env = "MSB_INSTANCE_ID", value_name = "id")]
    pub instance_id: Option<String>,

    /// Number of concurrently executing timeout callbacks
    #[structopt(
        long = "timer-threads",
        env = "MSB_TIMER_THREADS",
        default_value = "2",
        value_name = "count"
    )]
    pub timer_thread_pool_size: usize,

    /// Number of concurrently executing message handlers shared across all topics.
    ///
    /// When omitted, messages of each topic are handled one at a time.
    #[structopt(long = "consumer-threads", env = "MSB_CONSUMER_THREADS", value_name = "count")]
    pub consumer_thread_pool_size: Option<usize>,

    /// Response timeout in milliseconds used when a conversation does not specify one
    #[structopt(
        long = "response-timeout",
        env = "MSB_RESPONSE_TIMEOUT",
        default_value = "3000",
        value_name = "ms"
    )]
    pub default_response_timeout_ms: u64,

    /// Acknowledgement timeout in milliseconds applied to requests that do not specify one
    #[structopt(long = "ack-timeout", env = "MSB_ACK_TIMEOUT", value_name = "ms")]
    pub default_ack_timeout_ms: Option<u64>,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub broker: BrokerOptions,
}

/// Options passed on to transport adapters
#[derive(Debug, Clone, StructOpt)]
pub struct BrokerOptions {
    /// Whether queues of request topics survive broker restarts
    #[structopt(
        long = "durable",
        env = "MSB_DURABLE",
        default_value = "false",
        parse(try_from_str),
        value_name = "bool"
    )]
    pub durable: bool,

    /// Consumer group shared by all instances of a service.
    ///
    /// Instances within one group compete for requests. When omitted,
    /// every subscription receives its own copy of each message.
    #[structopt(long = "group-id", env = "MSB_GROUP_ID", value_name = "id")]
    pub group_id: Option<String>,

    /// Number of delivered messages a consumer may hold before it finished handling them
    #[structopt(
        long = "prefetch",
        env = "MSB_PREFETCH",
        default_value = "1",
        value_name = "count"
    )]
    pub prefetch_count: u16,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            durable: false,
            group_id: None,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

impl Default for MsbConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.into(),
            service_version: DEFAULT_SERVICE_VERSION.into(),
            instance_id: None,
            timer_thread_pool_size: DEFAULT_TIMER_THREADS,
            consumer_thread_pool_size: None,
            default_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            default_ack_timeout_ms: None,
            broker: BrokerOptions::default(),
        }
    }
}

impl MsbConfig {
    /// Rejects values the bus can not operate with
    pub fn validate(&self) -> Result<(), MsbError> {
        if self.service_name.trim().is_empty() {
            return Err(MsbError::Configuration("service name is empty".into()));
        }

        if self.timer_thread_pool_size == 0 {
            return Err(MsbError::Configuration(
                "timer thread pool size must be positive".into(),
            ));
        }

        if self.consumer_thread_pool_size == Some(0) {
            return Err(MsbError::Configuration(
                "consumer thread pool size must be positive".into(),
            ));
        }

        if self.broker.prefetch_count == 0 {
            return Err(MsbError::Configuration(
                "prefetch count must be positive".into(),
            ));
        }

        if matches!(&self.instance_id, Some(id) if id.trim().is_empty()) {
            return Err(MsbError::Configuration("instance id is empty".into()));
        }

        Ok(())
    }

    /// Fallback duration for response timers
    pub fn default_response_timeout(&self) -> Duration {
        Duration::from_millis(self.default_response_timeout_ms)
    }

    /// Resolves the identity of this instance, generating an instance id if none is configured.
    ///
    /// Call this once per process context, the generated id differs between calls.
    pub fn service_details(&self) -> ServiceDetails {
        ServiceDetails {
            name: self.service_name.clone(),
            version: self.service_version.clone(),
            instance_id: self
                .instance_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

/// Identity of the publishing service instance
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetails {
    /// Name of the service
    pub name: String,
    /// Version of the service
    pub version: String,
    /// Unique identifier of the instance
    pub instance_id: String,
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_flattened_options() {
        let config = MsbConfig::from_iter_safe(vec![
            "msb",
            "--service-name",
            "pong",
            "--instance-id",
            "abc",
            "--group-id",
            "workers",
            "--durable",
            "true",
            "--consumer-threads",
            "4",
        ])
        .unwrap();

        assert_eq!(config.service_name, "pong");
        assert_eq!(config.instance_id.as_deref(), Some("abc"));
        assert_eq!(config.broker.group_id.as_deref(), Some("workers"));
        assert!(config.broker.durable);
        assert_eq!(config.consumer_thread_pool_size, Some(4));
        assert_eq!(config.timer_thread_pool_size, DEFAULT_TIMER_THREADS);
    }

    #[test]
    fn keep_configured_instance_id() {
        let config = MsbConfig {
            instance_id: Some("instance".into()),
            ..Default::default()
        };

        assert_eq!(config.service_details().instance_id, "instance");
    }

    #[test]
    fn generate_missing_instance_id() {
        let config = MsbConfig::default();
        let details = config.service_details();

        assert!(Uuid::parse_str(&details.instance_id).is_ok());
        assert_ne!(details.instance_id, config.service_details().instance_id);
    }

    #[test]
    fn reject_empty_timer_pool() {
        let config = MsbConfig {
            timer_thread_pool_size: 0,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(MsbError::Configuration(_))));
    }

    #[test]
    fn reject_empty_consumer_pool() {
        let config = MsbConfig {
            consumer_thread_pool_size: Some(0),
            ..Default::default()
        };

        assert!(config.validate().is_err());
        assert!(MsbConfig::default().validate().is_ok());
    }

    #[test]
    fn reject_empty_prefetch_window() {
        let config = MsbConfig {
            broker: BrokerOptions {
                prefetch_count: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }
}
