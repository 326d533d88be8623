use axum::{
    extract::ConnectInfo,
    http::{header::InvalidHeaderValue, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use utoipa::ToSchema;

use super::{
    auth::{AuthConfig, AuthService},
    error::ApiError,
    health::HealthCache,
    ratelimit::{RateLimitAction, RateLimitDecision, RateLimits},
    store::SessionHandle,
};

pub mod health;
pub mod session;
pub mod users;

pub const SESSION_COOKIE_NAME: &str = "baduk_session";

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppState {
    pub auth: AuthService,
    pub limits: RateLimits,
    pub health: HealthCache,
    pub environment: String,
}

#[derive(ToSchema, Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ActivateRequest {
    pub token: String,
}

#[derive(ToSchema, Deserialize, Serialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

/// Client identity for throttling: proxy headers first, then the peer address.
pub(crate) fn client_key(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> String {
    extract_client_ip(headers)
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Extract a client IP for rate limiting from common proxy headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn throttle(
    state: &AppState,
    action: RateLimitAction,
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> Result<(), ApiError> {
    let key = client_key(headers, connect_info);
    match state.limits.check(action, &key) {
        RateLimitDecision::Allowed => Ok(()),
        RateLimitDecision::Limited => Err(ApiError::RateLimited),
    }
}

/// Session handle from the `baduk_session` cookie.
pub(crate) fn extract_session_handle(headers: &HeaderMap) -> Option<SessionHandle> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    value
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == SESSION_COOKIE_NAME)
        .and_then(|(_, val)| SessionHandle::from_cookie(val))
}

/// Build a secure `HttpOnly` cookie for the session handle.
pub(crate) fn session_cookie(
    config: &AuthConfig,
    handle: &SessionHandle,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}",
        handle.as_str()
    );
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn forwarded_for_wins() {
        let headers = headers(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        let peer = ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000)));
        assert_eq!(client_key(&headers, Some(&peer)), "203.0.113.9");
    }

    #[test]
    fn real_ip_then_peer_then_unknown() {
        let peer = ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 4000)));
        assert_eq!(
            client_key(&headers(&[("x-real-ip", "198.51.100.2")]), Some(&peer)),
            "198.51.100.2"
        );
        assert_eq!(client_key(&HeaderMap::new(), Some(&peer)), "192.0.2.4");
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn session_cookie_is_parsed_among_others() {
        let headers = headers(&[("cookie", "theme=dark; baduk_session=abc123; lang=ko")]);
        let handle = extract_session_handle(&headers).unwrap();
        assert_eq!(handle.as_str(), "abc123");
        assert!(extract_session_handle(&headers_without_session()).is_none());
    }

    fn headers_without_session() -> HeaderMap {
        headers(&[("cookie", "theme=dark")])
    }

    #[test]
    fn cookies_follow_frontend_scheme() {
        let handle = SessionHandle::from_cookie("abc").unwrap();

        let https = AuthConfig::new("https://play.baduk.online".to_string());
        let cookie = session_cookie(&https, &handle).unwrap();
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("baduk_session=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.ends_with("; Secure"));

        let http = AuthConfig::new("http://localhost:5173".to_string());
        let cleared = clear_session_cookie(&http).unwrap();
        let cleared = cleared.to_str().unwrap();
        assert!(cleared.contains("Max-Age=0"));
        assert!(!cleared.contains("Secure"));
    }
}
