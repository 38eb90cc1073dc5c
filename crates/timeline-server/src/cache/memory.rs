//! In-process timeline storage used when Redis is disabled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use timeline_core::{PostRef, SortableId};

use super::{
    ListSlice, RepoError, TimelineRepository, newer_range, newer_slice, older_slice,
    strip_end_marker,
};

/// Lists kept without a TTL live this long.
const DEFAULT_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// A stored timeline with TTL support.
#[derive(Clone, Debug)]
pub struct StoredList {
    pub entries: Vec<PostRef>,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl StoredList {
    pub fn new(entries: Vec<PostRef>, ttl: Duration) -> Self {
        Self {
            entries,
            stored_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }

    fn touch(&mut self, ttl: Option<Duration>) {
        if let Some(ttl) = ttl {
            self.stored_at = Instant::now();
            self.ttl = ttl;
        }
    }
}

/// Timeline storage on a local `DashMap`, head = newest like the Redis lists.
#[derive(Clone, Default)]
pub struct MemoryTimelineRepository {
    lists: Arc<DashMap<SortableId, StoredList>>,
}

impl MemoryTimelineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored entries including the end marker (for tests).
    pub fn raw_entries(&self, user_id: SortableId) -> Option<Vec<PostRef>> {
        self.lists
            .get(&user_id)
            .filter(|l| !l.is_expired())
            .map(|l| l.entries.clone())
    }

    /// Store entries as-is, bypassing `set_all` (no end marker is added).
    pub fn insert_raw(&self, user_id: SortableId, entries: Vec<PostRef>, ttl: Option<Duration>) {
        self.lists
            .insert(user_id, StoredList::new(entries, ttl.unwrap_or(DEFAULT_TTL)));
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Run `f` on the live list of `user_id`, dropping it first if expired.
    fn with_list<T>(
        &self,
        user_id: SortableId,
        f: impl FnOnce(&mut StoredList) -> T,
    ) -> Option<T> {
        self.lists.remove_if(&user_id, |_, list| list.is_expired());
        self.lists.get_mut(&user_id).map(|mut list| f(list.value_mut()))
    }
}

fn position(entries: &[PostRef], token: &PostRef) -> Result<usize, RepoError> {
    if entries.is_empty() {
        return Err(RepoError::KeyNotFound);
    }
    entries
        .iter()
        .position(|p| p == token)
        .ok_or(RepoError::ValueNotFound)
}

/// LRANGE-like inclusive slice that clamps out-of-range bounds.
fn range(entries: &[PostRef], start: usize, stop: usize) -> Vec<PostRef> {
    if start >= entries.len() || start > stop {
        return Vec::new();
    }
    entries[start..=stop.min(entries.len() - 1)].to_vec()
}

#[async_trait]
impl TimelineRepository for MemoryTimelineRepository {
    async fn get_page(
        &self,
        user_id: SortableId,
        offset: usize,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<Vec<PostRef>, RepoError> {
        self.with_list(user_id, |list| {
            list.touch(ttl);
            if limit == 0 {
                return Vec::new();
            }
            let mut posts = range(&list.entries, offset, offset + limit - 1);
            strip_end_marker(&mut posts);
            posts
        })
        .ok_or(RepoError::KeyNotFound)
    }

    async fn get_older(
        &self,
        user_id: SortableId,
        token: Option<&PostRef>,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<ListSlice, RepoError> {
        self.with_list(user_id, |list| -> Result<ListSlice, RepoError> {
            let pos = match token {
                Some(token) => position(&list.entries, token)?,
                None => 0,
            };
            let entries = range(&list.entries, pos, pos + limit);
            if entries.is_empty() {
                return Err(RepoError::KeyNotFound);
            }
            list.touch(ttl);
            Ok(older_slice(entries, limit))
        })
        .unwrap_or(Err(RepoError::KeyNotFound))
    }

    async fn get_newer(
        &self,
        user_id: SortableId,
        token: &PostRef,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<ListSlice, RepoError> {
        self.with_list(user_id, |list| -> Result<ListSlice, RepoError> {
            let pos = position(&list.entries, token)?;
            list.touch(ttl);
            Ok(match newer_range(pos, limit) {
                Some((start, stop)) => newer_slice(range(&list.entries, start, stop), start),
                None => ListSlice::default(),
            })
        })
        .unwrap_or(Err(RepoError::KeyNotFound))
    }

    async fn push_if_exists(
        &self,
        user_id: SortableId,
        post: &PostRef,
        cap: usize,
    ) -> Result<(), RepoError> {
        self.with_list(user_id, |list| {
            list.entries.insert(0, *post);
            list.entries.truncate(cap + 1);
        });
        Ok(())
    }

    async fn set_all(
        &self,
        user_id: SortableId,
        posts: &[PostRef],
        ttl: Duration,
    ) -> Result<(), RepoError> {
        let mut entries = Vec::with_capacity(posts.len() + 1);
        entries.extend_from_slice(posts);
        entries.push(PostRef::EMPTY);
        self.lists.insert(user_id, StoredList::new(entries, ttl));
        tracing::debug!(user_id = %user_id, posts = posts.len(), "timeline stored (memory)");
        Ok(())
    }

    async fn delete_post_if_exists(
        &self,
        user_id: SortableId,
        post: &PostRef,
    ) -> Result<(), RepoError> {
        self.with_list(user_id, |list| {
            if let Some(i) = list.entries.iter().position(|p| p == post) {
                list.entries.remove(i);
            }
        });
        // Redis drops a list once its last element is removed
        self.lists.remove_if(&user_id, |_, list| list.entries.is_empty());
        Ok(())
    }

    async fn delete_all(&self, user_id: SortableId) -> Result<(), RepoError> {
        self.lists.remove(&user_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RepoError> {
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "memory"
    }
}
