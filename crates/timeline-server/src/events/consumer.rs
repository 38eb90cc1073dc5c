//! Sequential consume loop.

use std::time::Duration;

use timeline_core::{CHANGE_TASK_EVENT_TYPE, MESSAGE_TYPE_HEADER};
use tokio_util::sync::CancellationToken;

use super::handler::{EventHandler, PipelineError};
use super::source::{EventSource, InboundMessage};

/// Pause after a failed poll before asking the source again.
const POLL_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Drives one [`EventSource`] through an [`EventHandler`], one message at a
/// time. A message is acknowledged only after it was handled or skipped.
pub struct EventConsumer<S> {
    source: S,
    handler: EventHandler,
    poll_timeout: Duration,
}

impl<S: EventSource> EventConsumer<S> {
    pub fn new(source: S, handler: EventHandler, poll_timeout: Duration) -> Self {
        Self {
            source,
            handler,
            poll_timeout,
        }
    }

    /// Consume until `cancel` fires or a message cannot be applied.
    ///
    /// A failed message is left unacknowledged and stops the loop; the
    /// source is closed either way.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        tracing::info!("event consumer started");
        let result = self.consume(&cancel).await;
        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "failed to close event source");
        }
        match &result {
            Ok(()) => tracing::info!("event consumer stopped"),
            Err(e) => tracing::error!(error = %e, "event consumer failed"),
        }
        result
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                polled = self.source.poll(self.poll_timeout) => polled,
            };

            let message = match polled {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "failed to poll change events");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_ERROR_DELAY) => continue,
                    }
                }
            };

            match process(&self.handler, &message).await {
                Ok(()) => {}
                Err(PipelineError::Canceled) => {
                    tracing::info!(message_id = %message.id, "stopped while retrying, message left pending");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            if let Err(e) = self.source.commit(&message).await {
                // The message will be delivered and applied again.
                tracing::warn!(message_id = %message.id, error = %e, "failed to commit message");
            }
        }
    }
}

async fn process(handler: &EventHandler, message: &InboundMessage) -> Result<(), PipelineError> {
    if message.header(MESSAGE_TYPE_HEADER) != Some(CHANGE_TASK_EVENT_TYPE.as_bytes()) {
        tracing::debug!(message_id = %message.id, "skipping message of another type");
        return Ok(());
    }
    tracing::debug!(message_id = %message.id, "handling change event");
    handler.handle(&message.payload).await
}
