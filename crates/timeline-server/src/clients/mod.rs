//! Upstream services a timeline is rebuilt from.
//!
//! The timeline service only sees the two narrow traits below; the HTTP
//! clients in [`http`] are one way to satisfy them.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;
use timeline_core::{PostRef, SortableId};

pub use http::{HttpPostService, HttpRelationService};

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

/// Follow graph lookups.
#[async_trait]
pub trait RelationService: Send + Sync {
    /// Users followed by `user_id`, excluding muted ones.
    async fn list_not_muted_following_ids(
        &self,
        user_id: SortableId,
    ) -> Result<Vec<SortableId>, ClientError>;
}

/// Post lookups.
#[async_trait]
pub trait PostService: Send + Sync {
    /// Most recent posts of `user_ids`, newest first, at most `limit`.
    async fn list_post_ids_by_user_ids(
        &self,
        requesting_user: SortableId,
        user_ids: &[SortableId],
        limit: usize,
    ) -> Result<Vec<PostRef>, ClientError>;
}
