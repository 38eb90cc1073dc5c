//! Turns a change event into a timeline mutation, retrying failures.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use timeline_core::{ChangeTaskEvent, ChangeType, CoreError, IdError, PostRef, SortableId};
use tokio_util::sync::CancellationToken;

use super::retry::{ExponentialBackoff, RetryPolicy};
use super::source::SourceError;
use crate::timeline::{ServiceError, TimelineService};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to decode change event: {0}")]
    Decode(#[source] CoreError),

    #[error("giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("event processing canceled")]
    Canceled,

    #[error("event source error: {0}")]
    Source(#[from] SourceError),
}

/// A change event with its identifiers parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Push { user_id: SortableId, post: PostRef },
    DeletePost { user_id: SortableId, post: PostRef },
    DeleteTimeline { user_id: SortableId },
    Subscribe { user_id: SortableId, target_id: SortableId },
    Unsubscribe { user_id: SortableId, target_id: SortableId },
}

impl Mutation {
    /// `Ok(None)` for change types this consumer does not know.
    pub fn from_event(event: &ChangeTaskEvent) -> Result<Option<Self>, IdError> {
        let post = || -> Result<PostRef, IdError> {
            Ok(PostRef::new(
                SortableId::parse(&event.user_id)?,
                SortableId::parse(&event.post_id)?,
            ))
        };
        let target = || SortableId::parse(&event.target_user_id);

        let mutation = match event.change_type {
            ChangeType::PostInsert => Mutation::Push {
                user_id: target()?,
                post: post()?,
            },
            ChangeType::PostDelete => Mutation::DeletePost {
                user_id: target()?,
                post: post()?,
            },
            ChangeType::UserDelete => Mutation::DeleteTimeline { user_id: target()? },
            ChangeType::UserSubscribe => Mutation::Subscribe {
                user_id: SortableId::parse(&event.user_id)?,
                target_id: target()?,
            },
            ChangeType::UserUnsubscribe => Mutation::Unsubscribe {
                user_id: SortableId::parse(&event.user_id)?,
                target_id: target()?,
            },
            ChangeType::Unknown(_) => return Ok(None),
        };
        Ok(Some(mutation))
    }

    pub async fn apply(&self, service: &TimelineService) -> Result<(), ServiceError> {
        match *self {
            Mutation::Push { user_id, post } => service.push_post(user_id, post).await,
            Mutation::DeletePost { user_id, post } => service.delete_post(user_id, post).await,
            Mutation::DeleteTimeline { user_id } => service.delete_timeline(user_id).await,
            Mutation::Subscribe { user_id, target_id } => {
                service.subscribe_on_user(user_id, target_id).await
            }
            Mutation::Unsubscribe { user_id, target_id } => {
                service.unsubscribe_from_user(user_id, target_id).await
            }
        }
    }
}

pub struct EventHandler {
    service: Arc<TimelineService>,
    operation_timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl EventHandler {
    pub fn new(
        service: Arc<TimelineService>,
        operation_timeout: Duration,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            operation_timeout,
            retry,
            cancel,
        }
    }

    /// Apply one encoded change event.
    ///
    /// Returns `Ok` once the event is applied or can never be applied (bad
    /// identifiers, unknown type). Errors mean the event must not be
    /// acknowledged.
    pub async fn handle(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let event = ChangeTaskEvent::decode(payload).map_err(PipelineError::Decode)?;

        let mutation = match Mutation::from_event(&event) {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::debug!(change_type = %event.change_type, "skipping unknown change type");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    change_type = %event.change_type,
                    user_id = %event.user_id,
                    target_user_id = %event.target_user_id,
                    post_id = %event.post_id,
                    error = %e,
                    "dropping change event with invalid identifier"
                );
                return Ok(());
            }
        };

        self.apply_with_retry(&mutation).await
    }

    async fn apply_with_retry(&self, mutation: &Mutation) -> Result<(), PipelineError> {
        let mut backoff = ExponentialBackoff::new(self.retry.clone());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = tokio::time::timeout(self.operation_timeout, mutation.apply(&self.service))
                .await
                .unwrap_or(Err(ServiceError::DeadlineExceeded));

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let Some(delay) = backoff.next_backoff() else {
                tracing::error!(attempt, error = %err, ?mutation, "change event retries exhausted");
                return Err(PipelineError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            };

            tracing::warn!(
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "failed to apply change event, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PipelineError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
