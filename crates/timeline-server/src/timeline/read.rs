//! Read path: cached pages, cursor bookkeeping and rebuild on a miss.

use std::sync::Arc;

use timeline_core::{Cursor, Pagination, PostRef, SortableId};
use tokio_util::sync::CancellationToken;

use super::guard::{BuildOutput, GuardError};
use super::service::{
    BuildError, BuiltTimeline, ServiceError, TimelineConfig, TimelinePage, TimelineService,
};
use crate::cache::{RepoError, TimelineRepository};
use crate::clients::{PostService, RelationService};

impl TimelineService {
    /// Page of `parent`'s timeline, requested by `auth_user`.
    pub async fn list_timeline(
        &self,
        auth_user: SortableId,
        parent: SortableId,
        pagination: Pagination,
    ) -> Result<TimelinePage, ServiceError> {
        if auth_user != parent {
            return Err(ServiceError::PermissionDenied(
                "timeline belongs to another user".into(),
            ));
        }
        self.get_timeline(auth_user, pagination).await
    }

    pub async fn get_timeline(
        &self,
        user_id: SortableId,
        pagination: Pagination,
    ) -> Result<TimelinePage, ServiceError> {
        let size = pagination.effective_size()?;
        let ttl = Some(self.config.ttl);

        match pagination.cursor {
            Some(Cursor::Prev(prev)) => {
                let token = decode_token(&prev, "previous")?;
                match self.repo.get_newer(user_id, &token, size, ttl).await {
                    Ok(slice) => Ok(TimelinePage {
                        posts: slice.posts,
                        next_token: Some(prev),
                        prev_token: slice.boundary.map(|p| p.to_token()),
                    }),
                    // No rebuild here: a fresh timeline has no position to
                    // page back from.
                    Err(e) => Err(self.read_failed(user_id, e)),
                }
            }
            cursor => {
                let next = match cursor {
                    Some(Cursor::Next(next)) => Some(next),
                    _ => None,
                };
                let token = next
                    .as_deref()
                    .map(|t| decode_token(t, "next"))
                    .transpose()?;

                match self.repo.get_older(user_id, token.as_ref(), size, ttl).await {
                    Ok(slice) => Ok(TimelinePage {
                        posts: slice.posts,
                        next_token: slice.boundary.map(|p| p.to_token()),
                        prev_token: next,
                    }),
                    Err(e) => self.recover(user_id, size, token.is_some(), e).await,
                }
            }
        }
    }

    /// Map a failed cached read, rebuilding the timeline on a miss.
    async fn recover(
        &self,
        user_id: SortableId,
        size: usize,
        had_cursor: bool,
        err: RepoError,
    ) -> Result<TimelinePage, ServiceError> {
        match err {
            RepoError::KeyNotFound => {
                tracing::debug!(user_id = %user_id, "timeline not found in cache");
                let posts = self.get_timeline_from_scratch(user_id).await?;
                let page = first_page(&posts, size);
                if had_cursor {
                    // A rebuilt timeline cannot resume at the old position.
                    Err(ServiceError::InvalidatedToken(Box::new(page)))
                } else {
                    Ok(page)
                }
            }
            other => Err(self.read_failed(user_id, other)),
        }
    }

    fn read_failed(&self, user_id: SortableId, err: RepoError) -> ServiceError {
        match err {
            RepoError::ValueNotFound => ServiceError::invalid_argument("invalid pagination token"),
            other => {
                tracing::warn!(user_id = %user_id, error = %other, "failed to get timeline");
                other.into()
            }
        }
    }

    /// Rebuild `user_id`'s timeline from the upstream services.
    ///
    /// Concurrent misses for one user share a single build. The build runs
    /// under the process lifetime, so a caller going away does not stop it;
    /// the caller itself waits at most `build_timeout`.
    pub async fn get_timeline_from_scratch(
        &self,
        user_id: SortableId,
    ) -> Result<BuiltTimeline, ServiceError> {
        let build = self
            .guard
            .run_exclusive(&user_id.to_string(), || self.builder().run(user_id));

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ServiceError::Canceled),
            res = tokio::time::timeout(self.config.build_timeout, build) => match res {
                Err(_) => {
                    tracing::warn!(user_id = %user_id, "timed out waiting for timeline build");
                    Err(ServiceError::Canceled)
                }
                Ok(Ok(posts)) => Ok(posts),
                Ok(Err(GuardError::Build(BuildError::TimedOut | BuildError::Canceled))) => {
                    Err(ServiceError::Canceled)
                }
                Ok(Err(e)) => {
                    tracing::error!(user_id = %user_id, error = %e, "failed to build timeline");
                    Err(ServiceError::internal(e))
                }
            },
        }
    }

    fn builder(&self) -> TimelineBuilder {
        TimelineBuilder {
            repo: Arc::clone(&self.repo),
            relations: Arc::clone(&self.relations),
            posts: Arc::clone(&self.posts),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Owned handles for one rebuild, so it can outlive the request.
struct TimelineBuilder {
    repo: Arc<dyn TimelineRepository>,
    relations: Arc<dyn RelationService>,
    posts: Arc<dyn PostService>,
    config: TimelineConfig,
    shutdown: CancellationToken,
}

impl TimelineBuilder {
    /// Followees and their posts; the best-effort store is left to settle
    /// after waiters have the result.
    async fn run(self, user_id: SortableId) -> Result<BuildOutput<BuiltTimeline>, BuildError> {
        let fetch = async {
            let following = self.relations.list_not_muted_following_ids(user_id).await?;
            let posts = self
                .posts
                .list_post_ids_by_user_ids(user_id, &following, self.config.limit)
                .await?;
            Ok::<_, BuildError>(posts)
        };

        let posts = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(BuildError::Canceled),
            res = tokio::time::timeout(self.config.build_timeout, fetch) => {
                res.map_err(|_| BuildError::TimedOut)??
            }
        };
        tracing::info!(user_id = %user_id, posts = posts.len(), "timeline rebuilt");

        let posts: BuiltTimeline = Arc::new(posts);
        let stored = Arc::clone(&posts);
        let (repo, config) = (self.repo, self.config);
        let persist = async move {
            let store = repo.set_all(user_id, &stored, config.ttl);
            match tokio::time::timeout(config.build_timeout, store).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(user_id = %user_id, error = %e, "failed to set timeline")
                }
                Err(_) => tracing::error!(user_id = %user_id, "timed out storing timeline"),
            }
        };

        Ok(BuildOutput::then_settle(posts, persist))
    }
}

fn decode_token(token: &str, which: &str) -> Result<PostRef, ServiceError> {
    PostRef::from_token(token).map_err(|e| {
        ServiceError::invalid_argument(format!("invalid pagination parameter: {which} token: {e}"))
    })
}

/// First `size` posts of a rebuilt timeline, with a cursor to the rest.
fn first_page(posts: &[PostRef], size: usize) -> TimelinePage {
    let end = size.min(posts.len());
    TimelinePage {
        posts: posts[..end].to_vec(),
        next_token: posts.get(end).map(PostRef::to_token),
        prev_token: None,
    }
}
