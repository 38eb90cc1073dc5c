//! Write path: incremental changes applied by the event consumer.
//!
//! Every operation is safe to repeat. Timelines that are not cached are left
//! alone; they are rebuilt in full on the next read anyway.

use timeline_core::{PostRef, SortableId, merge_newest_first};

use super::service::{ServiceError, TimelineService};
use crate::cache::RepoError;

impl TimelineService {
    /// Prepend `post` to a cached timeline, trimming it to the limit.
    pub async fn push_post(&self, user_id: SortableId, post: PostRef) -> Result<(), ServiceError> {
        self.repo
            .push_if_exists(user_id, &post, self.config.limit)
            .await?;
        Ok(())
    }

    pub async fn delete_post(&self, user_id: SortableId, post: PostRef) -> Result<(), ServiceError> {
        self.repo.delete_post_if_exists(user_id, &post).await?;
        Ok(())
    }

    pub async fn delete_timeline(&self, user_id: SortableId) -> Result<(), ServiceError> {
        self.repo.delete_all(user_id).await?;
        Ok(())
    }

    /// Merge `target_id`'s recent posts into `user_id`'s cached timeline.
    pub async fn subscribe_on_user(
        &self,
        user_id: SortableId,
        target_id: SortableId,
    ) -> Result<(), ServiceError> {
        let limit = self.config.limit;
        let existing = match self.repo.get_older(user_id, None, limit, None).await {
            Ok(slice) => slice.posts,
            Err(RepoError::KeyNotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let incoming = self
            .posts
            .list_post_ids_by_user_ids(target_id, &[target_id], limit)
            .await
            .map_err(|e| {
                tracing::warn!(user_id = %user_id, target_id = %target_id, error = %e,
                    "failed to list target posts");
                ServiceError::internal(e)
            })?;

        let merged = merge_newest_first(&existing, &incoming, limit);
        tracing::debug!(
            user_id = %user_id,
            target_id = %target_id,
            before = existing.len(),
            after = merged.len(),
            "merged subscription into timeline"
        );
        self.repo.set_all(user_id, &merged, self.config.ttl).await?;
        Ok(())
    }

    /// Drop every post authored by `target_id` from a cached timeline.
    pub async fn unsubscribe_from_user(
        &self,
        user_id: SortableId,
        target_id: SortableId,
    ) -> Result<(), ServiceError> {
        let existing = match self
            .repo
            .get_older(user_id, None, self.config.limit, None)
            .await
        {
            Ok(slice) => slice.posts,
            Err(RepoError::KeyNotFound | RepoError::ValueNotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // TODO: backfill from the remaining followees when filtering leaves
        // the timeline well under the limit; today it stays short until expiry.
        let filtered: Vec<PostRef> = existing
            .into_iter()
            .filter(|p| p.author_id != target_id)
            .collect();
        self.repo
            .set_all(user_id, &filtered, self.config.ttl)
            .await?;
        Ok(())
    }
}
