//! Ordered-list timeline storage.
//!
//! ## Layout
//!
//! One list per user, head = newest post. Every entry is the 41-byte post
//! reference encoding. A rebuilt timeline always ends with the empty marker
//! ([`PostRef::EMPTY`]) so that "cached and empty" can be told apart from
//! "not cached":
//!
//! ```text
//! key absent           -> cache miss, rebuild
//! [EMPTY]              -> authoritatively no posts
//! [p9, p7, p4, EMPTY]  -> three posts, end of list reached after p4
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is disabled the server keeps timelines in process memory
//! ([`MemoryTimelineRepository`]); nothing is shared across instances then.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use timeline_core::{CodecError, PostRef, SortableId};

pub use memory::MemoryTimelineRepository;
pub use self::redis::RedisTimelineRepository;

/// Upper bound for a detached TTL refresh issued by a read.
pub const EXPIRE_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("timeline not found")]
    KeyNotFound,

    #[error("post not found in timeline")]
    ValueNotFound,

    #[error("timeline storage timed out")]
    Timeout,

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("corrupted timeline entry: {0}")]
    Corrupted(#[from] CodecError),
}

/// A slice of a timeline plus the boundary needed to continue paging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSlice {
    pub posts: Vec<PostRef>,
    /// For older pages: the first entry of the following page.
    /// For newer pages: the first entry of this page, when more newer posts exist.
    pub boundary: Option<PostRef>,
}

/// Per-user timeline storage.
#[async_trait]
pub trait TimelineRepository: Send + Sync {
    /// Up to `limit` entries starting at `offset`, end-of-list marker stripped.
    async fn get_page(
        &self,
        user_id: SortableId,
        offset: usize,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<Vec<PostRef>, RepoError>;

    /// Page toward older posts starting at `token` (inclusive), or at the head.
    async fn get_older(
        &self,
        user_id: SortableId,
        token: Option<&PostRef>,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<ListSlice, RepoError>;

    /// Page toward newer posts ending just before `token`.
    async fn get_newer(
        &self,
        user_id: SortableId,
        token: &PostRef,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<ListSlice, RepoError>;

    /// Prepend `post` if the timeline is cached; no-op otherwise.
    async fn push_if_exists(
        &self,
        user_id: SortableId,
        post: &PostRef,
        cap: usize,
    ) -> Result<(), RepoError>;

    /// Replace the whole timeline with `posts` (newest first).
    async fn set_all(
        &self,
        user_id: SortableId,
        posts: &[PostRef],
        ttl: Duration,
    ) -> Result<(), RepoError>;

    /// Remove the first occurrence of `post`.
    async fn delete_post_if_exists(
        &self,
        user_id: SortableId,
        post: &PostRef,
    ) -> Result<(), RepoError>;

    async fn delete_all(&self, user_id: SortableId) -> Result<(), RepoError>;

    /// Check the storage is reachable (readiness probe).
    async fn ping(&self) -> Result<(), RepoError>;

    /// Storage mode, for diagnostics.
    fn mode(&self) -> &'static str;
}

/// Turn a range of `limit + 1` entries read from `pos` into a page.
///
/// The extra entry, if present, starts the next page unless it is the end
/// marker. A short read ends the timeline and drops a trailing marker.
pub(crate) fn older_slice(mut entries: Vec<PostRef>, limit: usize) -> ListSlice {
    if entries.len() > limit {
        entries.truncate(limit + 1);
        let extra = entries.pop().filter(|p| !p.is_empty_marker());
        return ListSlice {
            posts: entries,
            boundary: extra,
        };
    }

    strip_end_marker(&mut entries);
    ListSlice {
        posts: entries,
        boundary: None,
    }
}

/// Inclusive index range of the page ending just before `pos`, if any.
pub(crate) fn newer_range(pos: usize, limit: usize) -> Option<(usize, usize)> {
    if pos == 0 || limit == 0 {
        return None;
    }
    Some((pos.saturating_sub(limit), pos - 1))
}

/// Build a newer page from the entries read at `start`.
pub(crate) fn newer_slice(entries: Vec<PostRef>, start: usize) -> ListSlice {
    let boundary = if start > 0 { entries.first().copied() } else { None };
    ListSlice {
        posts: entries,
        boundary,
    }
}

pub(crate) fn strip_end_marker(entries: &mut Vec<PostRef>) {
    if entries.last().is_some_and(PostRef::is_empty_marker) {
        entries.pop();
    }
}
