use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use timeline_core::PostRef;

/// Non-standard status used by proxies for a client that went away mid-request.
const CLIENT_CLOSED_REQUEST: u16 = 499;

// -------------------------
// Wire types
// -------------------------

/// Post reference as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostDto {
    pub author_id: String,
    pub post_id: String,
    pub is_repost: bool,
}

impl From<&PostRef> for PostDto {
    fn from(p: &PostRef) -> Self {
        Self {
            author_id: p.author_id.to_string(),
            post_id: p.post_id.to_string(),
            is_repost: p.is_repost,
        }
    }
}

/// Query parameters of `GET /v1/users/{parent}/timeline`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTimelineQuery {
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub prev_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListTimelineResponse {
    pub posts: Vec<PostDto>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_page_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prev_page_token: String,
}

impl ListTimelineResponse {
    pub fn new(posts: &[PostRef], next_token: Option<String>, prev_token: Option<String>) -> Self {
        Self {
            posts: posts.iter().map(PostDto::from).collect(),
            next_page_token: next_token.unwrap_or_default(),
            prev_page_token: prev_token.unwrap_or_default(),
        }
    }
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Body of a degraded response: a usable first page plus the reason the
/// requested page could not be served.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DegradedTimelineResponse {
    #[serde(flatten)]
    pub page: ListTimelineResponse,
    pub error: ErrorBody,
}

// -------------------------
// Errors
// -------------------------

/// High-level API errors to be mapped to HTTP responses
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Precondition failed: {message}")]
    PreconditionFailed {
        message: String,
        page: Option<ListTimelineResponse>,
    },
    #[error("Request canceled: {0}")]
    Canceled(String),
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
    pub fn precondition_failed(msg: impl Into<String>, page: Option<ListTimelineResponse>) -> Self {
        Self::PreconditionFailed {
            message: msg.into(),
            page,
        }
    }
    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::Canceled(msg.into())
    }
    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            ApiError::Canceled(_) => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            ApiError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, named after the matching RPC status.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_argument",
            ApiError::Unauthorized(_) => "unauthenticated",
            ApiError::Forbidden(_) => "permission_denied",
            ApiError::PreconditionFailed { .. } => "failed_precondition",
            ApiError::Canceled(_) => "canceled",
            ApiError::DeadlineExceeded(_) => "deadline_exceeded",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::Canceled(m)
            | ApiError::DeadlineExceeded(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m.clone(),
            ApiError::PreconditionFailed { message, .. } => message.clone(),
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.to_error_body();

        // A degraded page still carries posts the client can render.
        if let ApiError::PreconditionFailed {
            page: Some(page), ..
        } = self
        {
            return (status, Json(DegradedTimelineResponse { page, error })).into_response();
        }

        (status, Json(serde_json::json!({ "error": error }))).into_response()
    }
}
