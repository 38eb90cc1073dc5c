//! Change event pipeline.
//!
//! Keeps cached timelines in step with posts and follow relations. Events
//! are read from an [`EventSource`] one at a time, filtered by their type
//! fingerprint, decoded and applied to the [`TimelineService`] with retries.
//! A message is acknowledged only once it has been applied, or when it can
//! never be (unknown type, malformed identifier). When retries run out the
//! consumer stops instead of dropping the change.
//!
//! [`TimelineService`]: crate::timeline::TimelineService

pub mod consumer;
pub mod handler;
pub mod redis;
pub mod retry;
pub mod source;

pub use consumer::EventConsumer;
pub use handler::{EventHandler, Mutation, PipelineError};
pub use self::redis::{RedisStreamSource, publish_change_event};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use source::{EventSource, InboundMessage, SourceError};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ListSlice, MemoryTimelineRepository, RepoError, TimelineRepository};
    use crate::clients::{ClientError, PostService, RelationService};
    use crate::timeline::{TimelineConfig, TimelineService};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use timeline_core::{
        CHANGE_TASK_EVENT_TYPE, ChangeTaskEvent, MESSAGE_TYPE_HEADER, PostRef, SortableId,
    };
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct SourceState {
        queue: VecDeque<InboundMessage>,
        committed: Vec<String>,
        closed: bool,
    }

    /// Messages from a queue; reports `None` once it is empty.
    #[derive(Clone, Default)]
    struct QueueSource(Arc<Mutex<SourceState>>);

    impl QueueSource {
        fn push(&self, message: InboundMessage) {
            self.0.lock().queue.push_back(message);
        }
        fn committed(&self) -> Vec<String> {
            self.0.lock().committed.clone()
        }
        fn closed(&self) -> bool {
            self.0.lock().closed
        }
    }

    #[async_trait]
    impl EventSource for QueueSource {
        async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, SourceError> {
            let next = self.0.lock().queue.pop_front();
            if next.is_none() {
                tokio::time::sleep(timeout).await;
            }
            Ok(next)
        }

        async fn commit(&mut self, message: &InboundMessage) -> Result<(), SourceError> {
            self.0.lock().committed.push(message.id.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SourceError> {
            self.0.lock().closed = true;
            Ok(())
        }
    }

    /// Memory storage whose pushes fail a given number of times first.
    struct FlakyRepo {
        inner: MemoryTimelineRepository,
        failures_left: AtomicUsize,
        push_attempts: AtomicUsize,
    }

    #[async_trait]
    impl TimelineRepository for FlakyRepo {
        async fn get_page(
            &self,
            user_id: SortableId,
            offset: usize,
            limit: usize,
            ttl: Option<Duration>,
        ) -> Result<Vec<PostRef>, RepoError> {
            self.inner.get_page(user_id, offset, limit, ttl).await
        }

        async fn get_older(
            &self,
            user_id: SortableId,
            token: Option<&PostRef>,
            limit: usize,
            ttl: Option<Duration>,
        ) -> Result<ListSlice, RepoError> {
            self.inner.get_older(user_id, token, limit, ttl).await
        }

        async fn get_newer(
            &self,
            user_id: SortableId,
            token: &PostRef,
            limit: usize,
            ttl: Option<Duration>,
        ) -> Result<ListSlice, RepoError> {
            self.inner.get_newer(user_id, token, limit, ttl).await
        }

        async fn push_if_exists(
            &self,
            user_id: SortableId,
            post: &PostRef,
            cap: usize,
        ) -> Result<(), RepoError> {
            self.push_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(RepoError::Pool("connection reset".into()));
            }
            self.inner.push_if_exists(user_id, post, cap).await
        }

        async fn set_all(
            &self,
            user_id: SortableId,
            posts: &[PostRef],
            ttl: Duration,
        ) -> Result<(), RepoError> {
            self.inner.set_all(user_id, posts, ttl).await
        }

        async fn delete_post_if_exists(
            &self,
            user_id: SortableId,
            post: &PostRef,
        ) -> Result<(), RepoError> {
            self.inner.delete_post_if_exists(user_id, post).await
        }

        async fn delete_all(&self, user_id: SortableId) -> Result<(), RepoError> {
            self.inner.delete_all(user_id).await
        }

        async fn ping(&self) -> Result<(), RepoError> {
            Ok(())
        }

        fn mode(&self) -> &'static str {
            "flaky"
        }
    }

    struct NoUpstream;

    #[async_trait]
    impl RelationService for NoUpstream {
        async fn list_not_muted_following_ids(
            &self,
            _user_id: SortableId,
        ) -> Result<Vec<SortableId>, ClientError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PostService for NoUpstream {
        async fn list_post_ids_by_user_ids(
            &self,
            _requesting_user: SortableId,
            _user_ids: &[SortableId],
            _limit: usize,
        ) -> Result<Vec<PostRef>, ClientError> {
            Ok(Vec::new())
        }
    }

    struct Pipeline {
        source: QueueSource,
        memory: MemoryTimelineRepository,
        repo: Arc<FlakyRepo>,
        consumer: EventConsumer<QueueSource>,
    }

    fn pipeline(failures: usize, max_elapsed: Duration) -> Pipeline {
        let memory = MemoryTimelineRepository::new();
        let repo = Arc::new(FlakyRepo {
            inner: memory.clone(),
            failures_left: AtomicUsize::new(failures),
            push_attempts: AtomicUsize::new(0),
        });
        let service = Arc::new(TimelineService::new(
            repo.clone(),
            Arc::new(NoUpstream),
            Arc::new(NoUpstream),
            TimelineConfig::default(),
            CancellationToken::new(),
        ));
        let retry = RetryPolicy {
            initial_interval: Duration::from_millis(10),
            multiplier: 1.5,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(50),
            max_elapsed,
        };
        let handler = EventHandler::new(
            service,
            Duration::from_secs(1),
            retry,
            CancellationToken::new(),
        );
        let source = QueueSource::default();
        let consumer = EventConsumer::new(source.clone(), handler, Duration::from_millis(5));
        Pipeline {
            source,
            memory,
            repo,
            consumer,
        }
    }

    fn id(n: u32) -> SortableId {
        SortableId::from_parts(2_000 + n, [0, 0, 5], 1, n)
    }

    fn message(id: &str, event: &ChangeTaskEvent) -> InboundMessage {
        let mut headers = HashMap::new();
        headers.insert(
            MESSAGE_TYPE_HEADER.to_string(),
            CHANGE_TASK_EVENT_TYPE.as_bytes().to_vec(),
        );
        InboundMessage {
            id: id.to_string(),
            key: Some(event.target_user_id.clone().into_bytes()),
            headers,
            payload: event.encode().unwrap(),
        }
    }

    /// Run the consumer until the queue is drained, then cancel it.
    async fn drain(p: Pipeline) -> (Result<(), PipelineError>, QueueSource) {
        let source = p.source.clone();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(p.consumer.run(cancel.clone()));
        for _ in 0..200 {
            if source.0.lock().queue.is_empty() || run.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        (run.await.unwrap(), source)
    }

    #[tokio::test]
    async fn test_events_applied_and_committed_in_order() {
        let p = pipeline(0, Duration::from_secs(1));
        let (me, author) = (id(1), id(2));
        p.memory.insert_raw(me, vec![PostRef::EMPTY], None);

        let insert = ChangeTaskEvent::post_insert(author.to_string(), me.to_string(), id(10).to_string());
        let insert2 = ChangeTaskEvent::post_insert(author.to_string(), me.to_string(), id(11).to_string());
        let delete = ChangeTaskEvent::post_delete(author.to_string(), me.to_string(), id(10).to_string());
        p.source.push(message("1-0", &insert));
        p.source.push(message("2-0", &insert2));
        p.source.push(message("3-0", &delete));
        let memory = p.memory.clone();

        let (result, source) = drain(p).await;
        result.unwrap();
        assert_eq!(source.committed(), vec!["1-0", "2-0", "3-0"]);
        assert!(source.closed());
        assert_eq!(
            memory.raw_entries(me).unwrap(),
            vec![PostRef::new(author, id(11)), PostRef::EMPTY]
        );
    }

    #[tokio::test]
    async fn test_foreign_and_unknown_messages_are_skipped() {
        let p = pipeline(0, Duration::from_secs(1));
        let mut foreign = message("1-0", &ChangeTaskEvent::user_delete(id(1).to_string()));
        foreign
            .headers
            .insert(MESSAGE_TYPE_HEADER.to_string(), b"other.v1.Event".to_vec());
        let mut headerless = message("2-0", &ChangeTaskEvent::user_delete(id(1).to_string()));
        headerless.headers.clear();
        let unknown = message(
            "3-0",
            &ChangeTaskEvent::new(timeline_core::ChangeType::Unknown(77), "", "", ""),
        );
        p.source.push(foreign);
        p.source.push(headerless);
        p.source.push(unknown);
        let memory = p.memory.clone();
        memory.insert_raw(id(1), vec![PostRef::EMPTY], None);

        let (result, source) = drain(p).await;
        result.unwrap();
        assert_eq!(source.committed(), vec!["1-0", "2-0", "3-0"]);
        assert!(memory.raw_entries(id(1)).is_some());
    }

    #[tokio::test]
    async fn test_malformed_id_is_committed_without_retry() {
        let p = pipeline(5, Duration::from_secs(1));
        let bad = ChangeTaskEvent::post_insert(id(2).to_string(), id(1).to_string(), "not-an-id");
        p.source.push(message("1-0", &bad));
        let repo = Arc::clone(&p.repo);

        let (result, source) = drain(p).await;
        result.unwrap();
        assert_eq!(source.committed(), vec!["1-0"]);
        assert_eq!(repo.push_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let p = pipeline(2, Duration::from_secs(5));
        let me = id(1);
        p.memory.insert_raw(me, vec![PostRef::EMPTY], None);
        let insert = ChangeTaskEvent::post_insert(id(2).to_string(), me.to_string(), id(9).to_string());
        p.source.push(message("1-0", &insert));
        let (repo, memory) = (Arc::clone(&p.repo), p.memory.clone());

        let (result, source) = drain(p).await;
        result.unwrap();
        assert_eq!(repo.push_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(source.committed(), vec!["1-0"]);
        assert_eq!(memory.raw_entries(me).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_stop_without_commit() {
        let p = pipeline(usize::MAX, Duration::from_millis(60));
        let insert = ChangeTaskEvent::post_insert(id(2).to_string(), id(1).to_string(), id(9).to_string());
        p.source.push(message("1-0", &insert));
        p.source.push(message("2-0", &insert));

        let (result, source) = drain(p).await;
        assert!(matches!(result, Err(PipelineError::RetriesExhausted { .. })));
        assert!(source.committed().is_empty());
        assert!(source.closed());
        // The second message is never read.
        assert_eq!(source.0.lock().queue.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_stops_consumer() {
        let p = pipeline(0, Duration::from_secs(1));
        let mut garbage = message("1-0", &ChangeTaskEvent::user_delete(id(1).to_string()));
        garbage.payload = vec![0xc1, 0x00];
        p.source.push(garbage);

        let (result, source) = drain(p).await;
        assert!(matches!(result, Err(PipelineError::Decode(_))));
        assert!(source.committed().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let memory = MemoryTimelineRepository::new();
        let repo = Arc::new(FlakyRepo {
            inner: memory,
            failures_left: AtomicUsize::new(usize::MAX),
            push_attempts: AtomicUsize::new(0),
        });
        let service = Arc::new(TimelineService::new(
            repo,
            Arc::new(NoUpstream),
            Arc::new(NoUpstream),
            TimelineConfig::default(),
            CancellationToken::new(),
        ));
        let cancel = CancellationToken::new();
        let retry = RetryPolicy {
            initial_interval: Duration::from_secs(30),
            randomization_factor: 0.0,
            ..RetryPolicy::default()
        };
        let handler = EventHandler::new(service, Duration::from_secs(1), retry, cancel.clone());
        let payload = ChangeTaskEvent::post_insert(id(2).to_string(), id(1).to_string(), id(9).to_string())
            .encode()
            .unwrap();

        let task = tokio::spawn(async move { handler.handle(&payload).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(PipelineError::Canceled)));
    }
}
