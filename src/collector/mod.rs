//! Correlation of replies with the requests that caused them
//!
//! Each outstanding request is tracked by a [`Collector`] which counts
//! acknowledgements and responses and races them against two timers. All
//! collectors waiting on the same response topic share one subscription which
//! is owned by a [`CollectorManager`].

#[allow(clippy::module_inception)]
mod collector;
mod manager;

pub use collector::*;
pub use manager::CollectorManager;
