//! Redis list backed timelines.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, LposOptions};
use timeline_core::{PostRef, SortableId};

use super::{
    EXPIRE_REFRESH_TIMEOUT, ListSlice, RepoError, TimelineRepository, newer_range, newer_slice,
    older_slice, strip_end_marker,
};

/// Timeline storage on a shared Redis instance.
///
/// Compound operations (position lookup, push + trim, full replace) run as
/// MULTI/EXEC pipelines; there is no other locking.
#[derive(Clone)]
pub struct RedisTimelineRepository {
    pool: Pool,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisTimelineRepository {
    pub fn new(pool: Pool, key_prefix: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            op_timeout,
        }
    }

    pub fn key(&self, user_id: SortableId) -> String {
        format!("{}{}", self.key_prefix, user_id)
    }

    async fn conn(&self) -> Result<Connection, RepoError> {
        self.pool
            .get()
            .await
            .map_err(|e| RepoError::Pool(e.to_string()))
    }

    /// Bound a storage call by the configured operation timeout.
    async fn timed<T, F>(&self, fut: F) -> Result<T, RepoError>
    where
        F: Future<Output = Result<T, RepoError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| RepoError::Timeout)?
    }

    /// Position of `token` in the list: LLEN and LPOS in one transaction.
    async fn position(&self, conn: &mut Connection, key: &str, token: &PostRef) -> Result<usize, RepoError> {
        let (len, pos): (usize, Option<usize>) = redis::pipe()
            .atomic()
            .llen(key)
            .lpos(key, token.encode().to_vec(), LposOptions::default())
            .query_async(conn)
            .await?;

        if len == 0 {
            return Err(RepoError::KeyNotFound);
        }
        pos.ok_or(RepoError::ValueNotFound)
    }

    /// Extend the key's TTL without holding up the read.
    fn refresh_ttl(&self, key: String, ttl: Option<Duration>) {
        let Some(ttl) = ttl else {
            return;
        };
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let refresh = async {
                let mut conn = pool.get().await.map_err(|e| RepoError::Pool(e.to_string()))?;
                conn.expire::<_, ()>(&key, ttl.as_secs() as i64).await?;
                Ok::<_, RepoError>(())
            };
            match tokio::time::timeout(EXPIRE_REFRESH_TIMEOUT, refresh).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(key = %key, error = %e, "failed to set expire"),
                Err(_) => tracing::error!(key = %key, "timed out setting expire"),
            }
        });
    }
}

fn decode_all(raw: Vec<Vec<u8>>) -> Result<Vec<PostRef>, RepoError> {
    raw.iter()
        .map(|bytes| PostRef::decode(bytes).map_err(RepoError::from))
        .collect()
}

#[async_trait]
impl TimelineRepository for RedisTimelineRepository {
    async fn get_page(
        &self,
        user_id: SortableId,
        offset: usize,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<Vec<PostRef>, RepoError> {
        let key = self.key(user_id);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (exists, raw): (bool, Vec<Vec<u8>>) = self
            .timed(async {
                let mut conn = self.conn().await?;
                let res: (bool, Vec<Vec<u8>>) = redis::pipe()
                    .atomic()
                    .exists(&key)
                    .lrange(&key, offset as isize, (offset + limit - 1) as isize)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, RepoError>(res)
            })
            .await?;

        if !exists {
            return Err(RepoError::KeyNotFound);
        }
        self.refresh_ttl(key, ttl);

        let mut posts = decode_all(raw)?;
        strip_end_marker(&mut posts);
        Ok(posts)
    }

    async fn get_older(
        &self,
        user_id: SortableId,
        token: Option<&PostRef>,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<ListSlice, RepoError> {
        let key = self.key(user_id);
        let raw: Vec<Vec<u8>> = self
            .timed(async {
                let mut conn = self.conn().await?;
                let pos = match token {
                    Some(token) => self.position(&mut conn, &key, token).await?,
                    None => 0,
                };
                // TODO: LPOS and LRANGE are both O(n); a server-side function could do one pass.
                let raw: Vec<Vec<u8>> = conn
                    .lrange(&key, pos as isize, (pos + limit) as isize)
                    .await?;
                Ok::<_, RepoError>(raw)
            })
            .await?;

        if raw.is_empty() {
            return Err(RepoError::KeyNotFound);
        }
        self.refresh_ttl(key, ttl);

        Ok(older_slice(decode_all(raw)?, limit))
    }

    async fn get_newer(
        &self,
        user_id: SortableId,
        token: &PostRef,
        limit: usize,
        ttl: Option<Duration>,
    ) -> Result<ListSlice, RepoError> {
        let key = self.key(user_id);
        let (start, raw): (usize, Vec<Vec<u8>>) = self
            .timed(async {
                let mut conn = self.conn().await?;
                let pos = self.position(&mut conn, &key, token).await?;
                let Some((start, stop)) = newer_range(pos, limit) else {
                    return Ok::<_, RepoError>((0, Vec::new()));
                };
                let raw: Vec<Vec<u8>> = conn.lrange(&key, start as isize, stop as isize).await?;
                Ok((start, raw))
            })
            .await?;

        self.refresh_ttl(key, ttl);
        Ok(newer_slice(decode_all(raw)?, start))
    }

    async fn push_if_exists(
        &self,
        user_id: SortableId,
        post: &PostRef,
        cap: usize,
    ) -> Result<(), RepoError> {
        let key = self.key(user_id);
        self.timed(async {
            let mut conn = self.conn().await?;
            // LTRIM keeps cap + 1 entries: room for the end marker
            let _: () = redis::pipe()
                .atomic()
                .lpush_exists(&key, post.encode().to_vec())
                .ignore()
                .ltrim(&key, 0, cap as isize)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, RepoError>(())
        })
        .await
    }

    async fn set_all(
        &self,
        user_id: SortableId,
        posts: &[PostRef],
        ttl: Duration,
    ) -> Result<(), RepoError> {
        let key = self.key(user_id);
        // LPUSH prepends each value in turn, so push oldest first.
        let values: Vec<Vec<u8>> = posts.iter().rev().map(|p| p.encode().to_vec()).collect();

        self.timed(async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .del(&key)
                .ignore()
                .lpush(&key, PostRef::EMPTY.encode().to_vec())
                .ignore();
            if !values.is_empty() {
                pipe.lpush(&key, values).ignore();
            }
            pipe.expire(&key, ttl.as_secs() as i64).ignore();
            let _: () = pipe.query_async(&mut conn).await?;
            Ok::<_, RepoError>(())
        })
        .await?;

        tracing::debug!(key = %key, posts = posts.len(), "timeline stored");
        Ok(())
    }

    async fn delete_post_if_exists(
        &self,
        user_id: SortableId,
        post: &PostRef,
    ) -> Result<(), RepoError> {
        let key = self.key(user_id);
        self.timed(async {
            let mut conn = self.conn().await?;
            conn.lrem::<_, _, ()>(&key, 1, post.encode().to_vec())
                .await?;
            Ok::<_, RepoError>(())
        })
        .await
    }

    async fn delete_all(&self, user_id: SortableId) -> Result<(), RepoError> {
        let key = self.key(user_id);
        self.timed(async {
            let mut conn = self.conn().await?;
            conn.del::<_, ()>(&key).await?;
            Ok::<_, RepoError>(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), RepoError> {
        self.timed(async {
            let mut conn = self.conn().await?;
            let _: () = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, RepoError>(())
        })
        .await
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}
