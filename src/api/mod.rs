//! Application facing side of the bus
//!
//! Everything starts with a [`MsbContext`], assembled through the [`MsbContextBuilder`]:
//!
//! - A [`Requester`] publishes requests on a namespace and collects the
//!   acknowledgements and responses to them. Each publish starts an independent
//!   conversation which ends once all expected responses arrived or a timeout passed.
//! - A [`ResponderServer`] listens on a namespace and hands every request together
//!   with a [`Responder`] to a [`RequestHandler`].

mod context;
mod options;
mod requester;
mod responder;

pub use crate::collector::{ConversationEnd, EndReason};
pub use context::{MsbContext, MsbContextBuilder};
pub use options::RequestOptions;
pub use requester::Requester;
pub use responder::{
    ErrorHandler, LoggingErrorHandler, RequestHandler, Responder, ResponderContext,
    ResponderServer,
};
