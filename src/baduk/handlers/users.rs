//! Account creation, activation and the current-user view.

use super::{
    extract_session_handle, throttle, ActivateRequest, AppState, CreateUserRequest,
};
use crate::baduk::{
    auth::Registration, error::ApiError, ratelimit::RateLimitAction, store::PublicAccount,
};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use std::{net::SocketAddr, sync::Arc};

#[utoipa::path(
    post,
    path = "/api/v1/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "Account created; activation email queued", body = PublicAccount),
        (status = 409, description = "Email already registered"),
        (status = 422, description = "Invalid name, email or password"),
        (status = 429, description = "Too many accounts created from this client"),
    ),
    tag = "users"
)]
pub async fn create_user(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    // Throttle before looking at the body so junk requests count too.
    throttle(&state, RateLimitAction::CreateUser, &headers, connect_info.as_ref())?;
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let account = state
        .auth
        .register(Registration {
            name: request.name,
            email: request.email,
            password: request.password,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(account)))
}

#[utoipa::path(
    post,
    path = "/api/v1/users/register",
    responses(
        (status = 200, description = "Activation email re-sent", body = PublicAccount),
        (status = 401, description = "No session"),
        (status = 409, description = "Account already activated"),
    ),
    tag = "users"
)]
pub async fn resend_activation(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let session = extract_session_handle(&headers);
    let account = state.auth.resend_activation(session.as_ref()).await?;
    Ok(Json(account))
}

#[utoipa::path(
    put,
    path = "/api/v1/users/activated",
    request_body = ActivateRequest,
    responses(
        (status = 200, description = "Account activated", body = PublicAccount),
        (status = 409, description = "Account changed concurrently"),
        (status = 422, description = "Invalid or expired activation token"),
        (status = 429, description = "Too many activation attempts"),
    ),
    tag = "users"
)]
pub async fn activate_user(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    state: Extension<Arc<AppState>>,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    throttle(&state, RateLimitAction::Activate, &headers, connect_info.as_ref())?;
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let account = state.auth.activate(&request.token).await?;
    Ok(Json(account))
}

#[utoipa::path(
    get,
    path = "/api/v1/user",
    responses(
        (status = 200, description = "Profile of the logged in user", body = PublicAccount),
        (status = 401, description = "No session"),
    ),
    tag = "users"
)]
pub async fn current_user(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let session = extract_session_handle(&headers);
    let account = state.auth.current_user(session.as_ref()).await?;
    Ok(Json(account))
}
