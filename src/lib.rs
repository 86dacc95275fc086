//! Message bus client implementing request/response messaging over pluggable transports
//!
//! In general, there are three modes of operation:
//!
//! 1. Fire and forget
//! 2. Request and response
//! 3. Request and aggregated responses
//!
//! The first simply publishes a [`Message`](message::Message) onto a topic and never
//! looks back. The latter two publish a request and then wait for acknowledgements
//! and responses from one or more responders. Acknowledgements may announce how many
//! responses a responder is about to send and how long it is going to take, which
//! allows the requesting side to end a conversation as soon as everything arrived
//! instead of waiting for a timeout.
//!
//! The protocol engine is split into a couple of layers:
//!
//! - [`channel`] multiplexes topics onto transport adapters. There is at most one
//!   [`Producer`](channel::Producer) and one [`Consumer`](channel::Consumer) per topic.
//! - [`collector`] routes inbound replies to the conversation that caused them and
//!   decides when a conversation is over.
//! - [`timer`] drives the timeouts of these conversations.
//! - [`api`] is the application facing side consisting of requesters and responders.
//!
//! The transport itself is hidden behind the traits in [`adapter`]. An in-memory
//! implementation is provided in [`adapter::memory`] which is used for testing and demos.

pub mod adapter;
pub mod api;
pub mod channel;
pub mod collector;
pub mod config;
pub mod message;
pub mod timer;

mod error;

pub use api::{
    ConversationEnd, EndReason, MsbContext, MsbContextBuilder, RequestOptions, Requester,
    Responder, ResponderContext, ResponderServer,
};
pub use config::MsbConfig;
pub use error::MsbError;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
