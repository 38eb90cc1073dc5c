//! Change events flowing from a Redis stream into Redis timelines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use timeline_core::{ChangeTaskEvent, MESSAGE_TYPE_HEADER, PostRef, SortableId};
use timeline_server::clients::{ClientError, PostService, RelationService};
use timeline_server::events::redis::publish_raw;
use timeline_server::events::{
    EventConsumer, EventHandler, EventSource, RedisStreamSource, RetryPolicy,
    publish_change_event,
};
use timeline_server::{
    RedisConfig, RedisTimelineRepository, TimelineConfig, TimelineRepository, TimelineService,
    connect_redis,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn pool() -> deadpool_redis::Pool {
    let cfg = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        ..RedisConfig::default()
    };
    connect_redis(&cfg).await.expect("redis pool")
}

struct TargetPosts(Vec<PostRef>);

#[async_trait]
impl RelationService for TargetPosts {
    async fn list_not_muted_following_ids(
        &self,
        _user_id: SortableId,
    ) -> Result<Vec<SortableId>, ClientError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl PostService for TargetPosts {
    async fn list_post_ids_by_user_ids(
        &self,
        _requesting_user: SortableId,
        user_ids: &[SortableId],
        _limit: usize,
    ) -> Result<Vec<PostRef>, ClientError> {
        Ok(self
            .0
            .iter()
            .filter(|p| user_ids.contains(&p.author_id))
            .copied()
            .collect())
    }
}

fn id(n: u32) -> SortableId {
    SortableId::from_parts(1_690_000_000 + n, [9, 9, 9], 5, n)
}

fn handler(repo: &RedisTimelineRepository, upstream: TargetPosts) -> EventHandler {
    let upstream = Arc::new(upstream);
    let service = Arc::new(TimelineService::new(
        Arc::new(repo.clone()),
        upstream.clone(),
        upstream,
        TimelineConfig::default(),
        CancellationToken::new(),
    ));
    EventHandler::new(
        service,
        Duration::from_secs(2),
        RetryPolicy::default(),
        CancellationToken::new(),
    )
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn consumer_applies_stream_events() {
    let pool = pool().await;
    let repo = RedisTimelineRepository::new(pool.clone(), "pipe1:", Duration::from_secs(2));
    let (me, alice, bob) = (id(1), id(2), id(3));
    let bob_posts = vec![PostRef::new(bob, id(60)), PostRef::new(bob, id(20))];

    repo.set_all(me, &[PostRef::new(alice, id(40))], Duration::from_secs(300))
        .await
        .unwrap();

    let stream = "pipe1-events";
    let insert = ChangeTaskEvent::post_insert(alice.to_string(), me.to_string(), id(50).to_string());
    let subscribe = ChangeTaskEvent::user_subscribe(me.to_string(), bob.to_string());
    let malformed = ChangeTaskEvent::post_insert(alice.to_string(), me.to_string(), "???");
    let mut foreign = HashMap::new();
    foreign.insert(MESSAGE_TYPE_HEADER.to_string(), b"other.v1.Thing".to_vec());
    foreign.insert("payload".to_string(), b"\x00\x01".to_vec());

    publish_change_event(&pool, stream, &insert).await.unwrap();
    publish_raw(&pool, stream, &foreign).await.unwrap();
    publish_change_event(&pool, stream, &malformed).await.unwrap();
    let last = publish_change_event(&pool, stream, &subscribe).await.unwrap();

    let source = RedisStreamSource::connect(&pool, stream, "pipe1-group", "worker-1")
        .await
        .unwrap();
    let consumer = EventConsumer::new(
        source,
        handler(&repo, TargetPosts(bob_posts.clone())),
        Duration::from_millis(100),
    );
    let cancel = CancellationToken::new();
    let run = tokio::spawn(consumer.run(cancel.clone()));

    let expected = vec![
        bob_posts[0],
        PostRef::new(alice, id(50)),
        PostRef::new(alice, id(40)),
        bob_posts[1],
    ];
    wait_until(|| {
        let repo = repo.clone();
        let expected = expected.clone();
        async move { repo.get_page(me, 0, 10, None).await.ok() == Some(expected) }
    })
    .await;

    // Every entry, including skipped ones, ends up acknowledged.
    let mut conn = pool.get().await.unwrap();
    wait_until(|| {
        let pool = pool.clone();
        async move {
            let mut conn = pool.get().await.unwrap();
            let pending: redis::streams::StreamPendingReply =
                conn.xpending(stream, "pipe1-group").await.unwrap();
            pending.count() == 0
        }
    })
    .await;
    let len: usize = conn.xlen(stream).await.unwrap();
    assert_eq!(len, 4);
    assert!(!last.is_empty());

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn unacknowledged_entries_are_redelivered() {
    let pool = pool().await;
    let stream = "pipe2-events";
    let event = ChangeTaskEvent::user_delete(id(7).to_string());
    let published = publish_change_event(&pool, stream, &event).await.unwrap();

    let mut first = RedisStreamSource::connect(&pool, stream, "pipe2-group", "worker-1")
        .await
        .unwrap();
    let delivered = first.poll(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(delivered.id, published);
    assert_eq!(delivered.key.as_deref(), Some(id(7).to_string().as_bytes()));
    first.close().await.unwrap();

    // Same consumer name after a restart: the pending entry comes back first
    let mut second = RedisStreamSource::connect(&pool, stream, "pipe2-group", "worker-1")
        .await
        .unwrap();
    let again = second.poll(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(again.id, published);
    second.commit(&again).await.unwrap();

    assert!(second.poll(Duration::from_millis(100)).await.unwrap().is_none());

    let mut third = RedisStreamSource::connect(&pool, stream, "pipe2-group", "worker-1")
        .await
        .unwrap();
    assert!(third.poll(Duration::from_millis(100)).await.unwrap().is_none());
}
