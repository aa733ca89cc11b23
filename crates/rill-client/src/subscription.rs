// Background consume loop: receive, decode, deliver, acknowledge.
use rill_envelope::Envelope;
use rill_gateway::{LogGateway, RecordStream};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Error;
use crate::handler::{CancelHandle, ErrorHandler, EventHandler};

/// A running subscription. Owns the cancellation handle and the loop task.
///
/// The loop terminates exactly once, by cancellation or by the first
/// unrecoverable error, and always reports through the error handler
/// before stopping.
pub struct Subscription {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn(state: SubscriptionLoop) -> Self {
        let cancel = state.cancel.clone();
        let task = tokio::spawn(state.run());
        Self { cancel, task }
    }

    /// Requests cancellation. The loop observes it on its next iteration or
    /// mid-pull, then reports a "context terminated" error and stops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clonable handle equivalent to the one passed to the handlers.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Whether the loop has reached its terminal state.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to stop. Does not itself cancel.
    pub async fn join(self) {
        // The loop never panics and is never aborted; a JoinError here
        // means the runtime is shutting down.
        let _ = self.task.await;
    }
}

pub(crate) struct SubscriptionLoop {
    pub(crate) gateway: Arc<dyn LogGateway>,
    pub(crate) topic: String,
    pub(crate) group: String,
    pub(crate) records: Box<dyn RecordStream>,
    pub(crate) cancel: CancelHandle,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
}

impl SubscriptionLoop {
    // One iteration = one record: pull, decode, deliver, ack. At most one
    // record is in flight; the ack strictly follows a successful delivery,
    // so an interruption between the two redelivers rather than drops.
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return self.stop(Error::Cancelled);
            }
            // The pull races the cancellation token, so a cancel landing
            // mid-pull stops the loop without waiting for the gateway.
            let cancel = self.cancel.clone();
            let pulled = tokio::select! {
                biased;
                _ = cancel.token().cancelled() => None,
                pulled = self.records.recv() => Some(pulled),
            };
            let record = match pulled {
                None => return self.stop(Error::Cancelled),
                Some(Ok(record)) => record,
                Some(Err(err)) => return self.stop(err.into()),
            };

            let envelope = match Envelope::from_bytes(&record.value) {
                Ok(envelope) => envelope,
                Err(err) => return self.stop(err.into()),
            };
            let payload = envelope.data();
            let content_type = envelope.content_type().unwrap_or_default();

            if let Err(cause) = self
                .handler
                .on_event(&self.cancel, payload, content_type)
                .await
            {
                // Not acked: the record stays pending for the group.
                return self.stop(Error::Handler(cause));
            }

            if let Err(err) = self
                .gateway
                .ack(&self.topic, &self.group, record.offset)
                .await
            {
                return self.stop(err.into());
            }
        }
    }

    fn stop(&self, err: Error) {
        debug!(topic = %self.topic, group = %self.group, error = %err, "subscription stopped");
        self.error_handler.on_error(&self.cancel, err);
    }
}
