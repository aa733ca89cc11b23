// Client for publishing and consuming events on a named, partitioned,
// offset-addressable log behind a gateway service.
//
// DESIGN INTENT
// -------------
// - One `StreamClient` is bound to one gateway address and one topic. Its
//   fields are set at construction and never mutated afterwards, apart from
//   the dead-after-close flag; the gateway handle is shared by publishes and
//   every subscription loop without internal locking.
// - Publish is synchronous in the caller's task: one envelope, one remote
//   round trip, no batching, no retry.
// - Subscribe performs the handshake up front, then detaches exactly one
//   background task per subscription. Records are handled strictly one at a
//   time and acknowledged only after the handler succeeds, giving
//   at-least-once delivery. All post-handshake failures, including
//   cancellation, funnel through the caller's error handler; nothing is
//   raised into the foreground.

use std::time::Duration;

mod client;
mod config;
mod handler;
mod subscription;
#[cfg(test)]
mod tests;

pub use client::{PublishResult, StreamClient};
pub use config::ClientConfig;
pub use handler::{BoxError, CancelHandle, ErrorHandler, EventHandler};
pub use subscription::Subscription;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connect to gateway {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("failed to connect to gateway")]
    Connect(#[source] rill_gateway::Error),
    #[error("content type {offered:?} not compatible with expected content type {required:?}")]
    IncompatibleContentType { offered: String, required: String },
    #[error(transparent)]
    Envelope(#[from] rill_envelope::Error),
    #[error(transparent)]
    Gateway(#[from] rill_gateway::Error),
    #[error("failed to read payload stream")]
    PayloadRead(#[source] std::io::Error),
    #[error("failed to read key stream")]
    KeyRead(#[source] std::io::Error),
    #[error("event handler failed")]
    Handler(#[source] BoxError),
    #[error("context terminated")]
    Cancelled,
    #[error("client is closed")]
    Closed,
}
