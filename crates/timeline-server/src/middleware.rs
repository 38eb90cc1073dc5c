use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use timeline_api::ApiError;
use timeline_core::SortableId;
use uuid::Uuid;

/// Header set by the gateway with the authenticated user's id.
pub const USER_ID_HEADER: &str = "x-user-id";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity of the caller, inserted into request extensions by [`authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub SortableId);

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    // Keep the caller's request id, otherwise generate one
    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(req).await,
        },
    };

    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

/// Require a valid caller identity in [`USER_ID_HEADER`].
///
/// The gateway in front of the service authenticates users; this only
/// checks the identity it forwards is present and well formed.
pub async fn authenticate(mut req: Request<Body>, next: Next) -> Response {
    let Some(raw) = req.headers().get(USER_ID_HEADER) else {
        return ApiError::unauthorized("missing caller identity").into_response();
    };
    let user = match raw.to_str().ok().map(SortableId::parse) {
        Some(Ok(user)) => user,
        _ => {
            tracing::debug!("rejecting request with malformed caller identity");
            return ApiError::unauthorized("invalid caller identity").into_response();
        }
    };

    req.extensions_mut().insert(AuthUser(user));
    next.run(req).await
}
