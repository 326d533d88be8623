//! Login and logout: the only handlers that set the session cookie.

use super::{
    clear_session_cookie, extract_session_handle, session_cookie, throttle, AppState,
    LoginRequest, MessageResponse,
};
use crate::baduk::{error::ApiError, ratelimit::RateLimitAction, store::PublicAccount};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Extension},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::error;

#[utoipa::path(
    post,
    path = "/api/v1/users/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in (or already logged in as this user)", body = PublicAccount),
        (status = 409, description = "Session belongs to a different user"),
        (status = 422, description = "Invalid email or password"),
        (status = 429, description = "Too many login attempts"),
    ),
    tag = "session"
)]
pub async fn login(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    throttle(&state, RateLimitAction::Login, &headers, connect_info.as_ref())?;
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let session = extract_session_handle(&headers);
    let outcome = state
        .auth
        .login(session.as_ref(), &request.email, &request.password)
        .await?;

    let mut response_headers = HeaderMap::new();
    if let Some(handle) = &outcome.new_session {
        let cookie = session_cookie(state.auth.config(), handle).map_err(|err| {
            error!("Failed to build session cookie: {err}");
            ApiError::Internal(err.into())
        })?;
        response_headers.insert(SET_COOKIE, cookie);
    }

    Ok((StatusCode::OK, response_headers, Json(outcome.account)))
}

#[utoipa::path(
    post,
    path = "/api/v1/users/logout",
    responses(
        (status = 200, description = "Session destroyed", body = MessageResponse),
    ),
    tag = "session"
)]
pub async fn logout(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let session = extract_session_handle(&headers);
    state.auth.logout(session.as_ref()).await?;

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.auth.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }

    Ok((
        StatusCode::OK,
        response_headers,
        Json(MessageResponse {
            message: "logged out successfully".to_string(),
        }),
    ))
}
