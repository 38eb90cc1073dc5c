use axum::{
    Extension, Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use timeline_api::{ApiError, ListTimelineQuery, ListTimelineResponse};
use timeline_core::{Pagination, SortableId};

use crate::middleware::AuthUser;
use crate::server::AppState;
use crate::timeline::{ServiceError, TimelinePage};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready once the timeline storage answers.
pub async fn readyz(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let repo = state.service.repository();
    repo.ping().await.map_err(|e| {
        tracing::warn!(error = %e, mode = repo.mode(), "timeline storage not ready");
        ApiError::unavailable("timeline storage unavailable")
    })?;
    Ok((StatusCode::OK, Json(HealthResponse { status: "ready" })))
}

/// `GET /v1/users/{parent}/timeline`
pub async fn list_timeline(
    State(state): State<AppState>,
    Extension(AuthUser(auth_user)): Extension<AuthUser>,
    Path(parent): Path<String>,
    query: Result<Query<ListTimelineQuery>, QueryRejection>,
) -> Result<Json<ListTimelineResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let parent = SortableId::parse(&parent)
        .map_err(|e| ApiError::bad_request(format!("invalid parent: {e}")))?;
    let pagination =
        Pagination::from_parts(query.page_size, query.next_page_token, query.prev_page_token)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let listed = tokio::time::timeout(
        state.request_timeout,
        state.service.list_timeline(auth_user, parent, pagination),
    )
    .await
    .map_err(|_| ApiError::deadline_exceeded("request timeout"))?;

    let page = listed?;
    Ok(Json(to_response(&page)))
}

fn to_response(page: &TimelinePage) -> ListTimelineResponse {
    ListTimelineResponse::new(&page.posts, page.next_token.clone(), page.prev_token.clone())
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidArgument(msg) => ApiError::bad_request(msg),
            ServiceError::PermissionDenied(msg) => ApiError::forbidden(msg),
            ServiceError::InvalidatedToken(ref page) => {
                ApiError::precondition_failed(e.to_string(), Some(to_response(page)))
            }
            ServiceError::Canceled => ApiError::canceled(e.to_string()),
            ServiceError::DeadlineExceeded => ApiError::deadline_exceeded(e.to_string()),
            ServiceError::Internal(detail) => {
                // the detail stays in the log; clients only see the status
                tracing::error!(error = %detail, "timeline request failed");
                ApiError::internal("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline_core::PostRef;

    #[test]
    fn test_invalidated_token_keeps_first_page() {
        let post = PostRef::new(
            SortableId::from_parts(1, [0, 0, 1], 1, 1),
            SortableId::from_parts(2, [0, 0, 1], 1, 2),
        );
        let page = TimelinePage {
            posts: vec![post],
            next_token: None,
            prev_token: None,
        };
        let api: ApiError = ServiceError::InvalidatedToken(Box::new(page)).into();
        assert_eq!(api.status_code(), StatusCode::PRECONDITION_FAILED);
        match api {
            ApiError::PreconditionFailed { page: Some(page), .. } => {
                assert_eq!(page.posts.len(), 1);
                assert_eq!(page.posts[0].post_id, post.post_id.to_string());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServiceError::invalid_argument("bad"), StatusCode::BAD_REQUEST),
            (ServiceError::PermissionDenied("no".into()), StatusCode::FORBIDDEN),
            (ServiceError::DeadlineExceeded, StatusCode::GATEWAY_TIMEOUT),
            (ServiceError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
        assert_eq!(ApiError::from(ServiceError::Canceled).status_code().as_u16(), 499);
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let err = ServiceError::internal("redis error: connection refused (os error 111) at 10.0.0.7:6379");
        let api = ApiError::from(err);
        assert_eq!(api.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        match &api {
            ApiError::Internal(msg) => assert_eq!(msg, "internal error"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!api.to_string().contains("10.0.0.7"));
    }
}
