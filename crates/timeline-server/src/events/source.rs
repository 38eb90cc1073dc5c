//! Where change events come from.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// A message as delivered by the transport, before any decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Transport id, used to acknowledge the message
    pub id: String,
    pub key: Option<Vec<u8>>,
    pub headers: HashMap<String, Vec<u8>>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("failed to encode event: {0}")]
    Encode(String),

    #[error("event source is closed")]
    Closed,
}

/// An at-least-once message source with explicit acknowledgement.
#[async_trait]
pub trait EventSource: Send {
    /// Wait up to `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, SourceError>;

    /// Mark `message` as processed; it will not be delivered again.
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), SourceError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}
