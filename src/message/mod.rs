//! Envelope exchanged between requesters and responders
//!
//! Every [`Message`] carries a `correlation_id` which is shared by a request and all
//! of its replies. Replies are published to the response topic of the request which
//! is derived from the request topic and the instance id of the requester (see
//! [`response_topic`]). Replies may carry an [`Acknowledge`], a payload or both.

mod factory;
#[allow(clippy::module_inception)]
mod message;
mod topic;

pub use factory::*;
pub use message::*;
pub use topic::*;
