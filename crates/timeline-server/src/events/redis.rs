//! Change events over a Redis stream with a consumer group.
//!
//! Each stream entry carries three fields: the type fingerprint under
//! [`MESSAGE_TYPE_HEADER`], the partition `key` (the user whose timeline
//! changes) and the MessagePack `payload`. Progress is tracked by the group;
//! an entry stays pending until it is acknowledged with XACK.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use timeline_core::{CHANGE_TASK_EVENT_TYPE, ChangeTaskEvent, MESSAGE_TYPE_HEADER};

use super::source::{EventSource, InboundMessage, SourceError};

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";

/// Reads one entry at a time for `consumer` in `group`.
///
/// On start the consumer first re-reads its own pending entries (delivered
/// before a crash or shutdown but never acknowledged), then switches to new
/// entries.
pub struct RedisStreamSource {
    conn: Option<Connection>,
    stream: String,
    group: String,
    consumer: String,
    backlog_drained: bool,
}

impl RedisStreamSource {
    /// Take a connection from `pool` and make sure the consumer group exists.
    pub async fn connect(
        pool: &Pool,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let stream = stream.into();
        let group = group.into();
        let mut conn = pool
            .get()
            .await
            .map_err(|e| SourceError::Pool(e.to_string()))?;

        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(&stream, &group, "0").await;
        match created {
            Ok(()) => tracing::info!(stream = %stream, group = %group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            conn: Some(conn),
            stream,
            group,
            consumer: consumer.into(),
            backlog_drained: false,
        })
    }

    async fn read(&mut self, id: &str, block: Duration) -> Result<Option<InboundMessage>, SourceError> {
        let conn = self.conn.as_mut().ok_or(SourceError::Closed)?;
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if id == ">" {
            opts = opts.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> =
            conn.xread_options(&[&self.stream], &[id], &opts).await?;
        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
            .map(to_message))
    }
}

fn to_message(entry: StreamId) -> InboundMessage {
    let mut message = InboundMessage {
        id: entry.id,
        ..Default::default()
    };
    for (field, value) in entry.map {
        let Ok(bytes) = redis::from_redis_value::<Vec<u8>>(&value) else {
            tracing::warn!(message_id = %message.id, field = %field, "ignoring non-binary field");
            continue;
        };
        match field.as_str() {
            KEY_FIELD => message.key = Some(bytes),
            PAYLOAD_FIELD => message.payload = bytes,
            _ => {
                message.headers.insert(field, bytes);
            }
        }
    }
    message
}

#[async_trait]
impl EventSource for RedisStreamSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, SourceError> {
        if !self.backlog_drained {
            if let Some(pending) = self.read("0", timeout).await? {
                tracing::debug!(message_id = %pending.id, "redelivering pending entry");
                return Ok(Some(pending));
            }
            self.backlog_drained = true;
        }
        self.read(">", timeout).await
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), SourceError> {
        let conn = self.conn.as_mut().ok_or(SourceError::Closed)?;
        let _: i64 = conn.xack(&self.stream, &self.group, &[&message.id]).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.conn.take().is_some() {
            tracing::info!(stream = %self.stream, consumer = %self.consumer, "event source closed");
        }
        Ok(())
    }
}

/// Append `event` to `stream` with the fingerprint the consumer filters on.
///
/// Returns the id Redis assigned to the entry.
pub async fn publish_change_event(
    pool: &Pool,
    stream: &str,
    event: &ChangeTaskEvent,
) -> Result<String, SourceError> {
    let payload = event
        .encode()
        .map_err(|e| SourceError::Encode(e.to_string()))?;
    let mut conn = pool
        .get()
        .await
        .map_err(|e| SourceError::Pool(e.to_string()))?;

    let fields: [(&str, &[u8]); 3] = [
        (MESSAGE_TYPE_HEADER, CHANGE_TASK_EVENT_TYPE.as_bytes()),
        (KEY_FIELD, event.target_user_id.as_bytes()),
        (PAYLOAD_FIELD, payload.as_slice()),
    ];
    let id: String = conn.xadd(stream, "*", &fields).await?;
    tracing::debug!(stream = %stream, message_id = %id, change_type = %event.change_type,
        "published change event");
    Ok(id)
}

/// Append an entry with arbitrary `fields`, such as messages of other types
/// sharing the stream.
pub async fn publish_raw(
    pool: &Pool,
    stream: &str,
    fields: &HashMap<String, Vec<u8>>,
) -> Result<String, SourceError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| SourceError::Pool(e.to_string()))?;
    let items: Vec<(&str, &[u8])> = fields
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_slice()))
        .collect();
    let id: String = conn.xadd(stream, "*", &items).await?;
    Ok(id)
}
