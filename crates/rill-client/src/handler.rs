// Capability traits for subscription callbacks.
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Failure cause returned by an event handler. Carried as the source of
/// [`Error::Handler`] so it is never lost behind a synthetic wrapper.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handle that stops a subscription.
///
/// Cheap to clone; `cancel` is idempotent and safe to call from any task,
/// including from inside the subscription's own loop (the usual place being
/// an [`ErrorHandler`]).
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Processes records delivered by a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once per record, strictly in delivery order, with the
    /// envelope's payload and content type. Returning an error stops the
    /// subscription without acknowledging the record, so it will be
    /// redelivered to the group.
    async fn on_event(
        &self,
        ctx: &CancelHandle,
        payload: Bytes,
        content_type: &str,
    ) -> std::result::Result<(), BoxError>;
}

/// Receives every post-handshake subscription failure, cancellation
/// included.
pub trait ErrorHandler: Send + Sync {
    /// Invoked at most once per subscription, right before its loop stops.
    /// `cancel` may be called to flip the subscription's own cancellation
    /// state; the loop terminates either way.
    fn on_error(&self, cancel: &CancelHandle, err: Error);
}
