//! JSON-over-HTTP clients for the post and relation services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use timeline_core::{PostRef, SortableId};

use super::{ClientError, PostService, RelationService};
use crate::config::UpstreamConfig;

/// Header carrying the identity the upstream call is made on behalf of.
pub const USER_ID_HEADER: &str = "x-user-id";

fn build_client(cfg: &UpstreamConfig) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(cfg.timeout())
        .build()
        .map_err(|e| ClientError::Transport(format!("failed to create HTTP client: {e}")))
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

// -------------------------
// Relation service
// -------------------------

#[derive(Debug, Deserialize)]
struct FollowingIdsResponse {
    #[serde(default)]
    ids: Vec<String>,
}

pub struct HttpRelationService {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpRelationService {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, ClientError> {
        Ok(Self {
            http_client: build_client(cfg)?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RelationService for HttpRelationService {
    async fn list_not_muted_following_ids(
        &self,
        user_id: SortableId,
    ) -> Result<Vec<SortableId>, ClientError> {
        let url = format!("{}/v1/users/{}/following-ids", self.base_url, user_id);
        let resp = self
            .http_client
            .get(&url)
            .query(&[("muted", "false")])
            .send()
            .await?;
        let body: FollowingIdsResponse = ensure_success(resp).await?.json().await?;

        body.ids
            .iter()
            .map(|id| {
                SortableId::parse(id)
                    .map_err(|e| ClientError::Decode(format!("following id {id:?}: {e}")))
            })
            .collect()
    }
}

// -------------------------
// Post service
// -------------------------

#[derive(Debug, Serialize)]
struct ListIdProjectionsRequest {
    parents: Vec<String>,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct PostIdProjection {
    id: String,
    author_id: String,
    #[serde(default)]
    is_repost: bool,
}

#[derive(Debug, Deserialize)]
struct ListIdProjectionsResponse {
    #[serde(default)]
    post_id_projections: Vec<PostIdProjection>,
}

impl PostIdProjection {
    fn to_post_ref(&self) -> Option<PostRef> {
        let post_id = SortableId::parse(&self.id).ok()?;
        let author_id = SortableId::parse(&self.author_id).ok()?;
        Some(PostRef {
            author_id,
            post_id,
            is_repost: self.is_repost,
        })
    }
}

pub struct HttpPostService {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpPostService {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, ClientError> {
        Ok(Self {
            http_client: build_client(cfg)?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PostService for HttpPostService {
    async fn list_post_ids_by_user_ids(
        &self,
        requesting_user: SortableId,
        user_ids: &[SortableId],
        limit: usize,
    ) -> Result<Vec<PostRef>, ClientError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/posts:listIdProjections", self.base_url);
        let request = ListIdProjectionsRequest {
            parents: user_ids.iter().map(ToString::to_string).collect(),
            page_size: limit,
        };
        let resp = self
            .http_client
            .post(&url)
            .header(USER_ID_HEADER, requesting_user.to_string())
            .json(&request)
            .send()
            .await?;
        let body: ListIdProjectionsResponse = ensure_success(resp).await?.json().await?;

        let mut posts = Vec::with_capacity(body.post_id_projections.len());
        for projection in &body.post_id_projections {
            match projection.to_post_ref() {
                Some(post) => posts.push(post),
                None => tracing::warn!(
                    post_id = %projection.id,
                    author_id = %projection.author_id,
                    "skipping post projection with invalid id"
                ),
            }
        }
        Ok(posts)
    }
}
