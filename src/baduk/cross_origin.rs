//! Rejects state-changing browser requests that come from an untrusted origin.
//!
//! Safe methods always pass. Otherwise a request passes when its `Origin` is
//! trusted, when the browser marks it `Sec-Fetch-Site: same-origin` or `none`,
//! or when it carries neither header (not a browser). Without `Sec-Fetch-Site`
//! the `Origin` host must match `Host`.

use axum::{
    extract::{Request, State},
    http::{
        header::{HOST, ORIGIN},
        HeaderMap, HeaderValue, Method,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;
use url::Url;

use super::error::ApiError;

const SEC_FETCH_SITE: &str = "sec-fetch-site";

#[derive(Clone, Debug, Default)]
pub struct TrustedOrigins(Arc<Vec<HeaderValue>>);

impl TrustedOrigins {
    #[must_use]
    pub fn new(origins: Vec<HeaderValue>) -> Self {
        Self(Arc::new(origins))
    }

    fn contains(&self, origin: &HeaderValue) -> bool {
        self.0.iter().any(|trusted| trusted == origin)
    }
}

#[must_use]
pub fn is_allowed(trusted: &TrustedOrigins, method: &Method, headers: &HeaderMap) -> bool {
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return true;
    }

    let origin = headers.get(ORIGIN);
    if origin.is_some_and(|origin| trusted.contains(origin)) {
        return true;
    }

    if let Some(site) = headers.get(SEC_FETCH_SITE) {
        return matches!(site.to_str(), Ok("same-origin" | "none"));
    }

    let Some(origin) = origin else {
        return true;
    };
    let host = headers.get(HOST).and_then(|host| host.to_str().ok());
    match (origin_authority(origin), host) {
        (Some(authority), Some(host)) => authority.eq_ignore_ascii_case(host),
        _ => false,
    }
}

fn origin_authority(origin: &HeaderValue) -> Option<String> {
    let url = Url::parse(origin.to_str().ok()?).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// axum middleware wrapping [`is_allowed`].
pub async fn protect(
    State(trusted): State<TrustedOrigins>,
    request: Request,
    next: Next,
) -> Response {
    if is_allowed(&trusted, request.method(), request.headers()) {
        return next.run(request).await;
    }

    warn!(
        method = %request.method(),
        uri = %request.uri(),
        origin = ?request.headers().get(ORIGIN),
        "cross-origin request rejected"
    );
    ApiError::CrossOrigin.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted() -> TrustedOrigins {
        TrustedOrigins::new(vec![HeaderValue::from_static("https://play.baduk.online")])
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn safe_methods_always_pass() {
        let cross = headers(&[("origin", "https://evil.example"), (SEC_FETCH_SITE, "cross-site")]);
        assert!(is_allowed(&trusted(), &Method::GET, &cross));
        assert!(is_allowed(&trusted(), &Method::OPTIONS, &cross));
        assert!(!is_allowed(&trusted(), &Method::POST, &cross));
    }

    #[test]
    fn trusted_origin_passes_cross_site() {
        let map = headers(&[
            ("origin", "https://play.baduk.online"),
            (SEC_FETCH_SITE, "same-site"),
        ]);
        assert!(is_allowed(&trusted(), &Method::PUT, &map));
    }

    #[test]
    fn fetch_metadata_decides_for_untrusted_origins() {
        assert!(is_allowed(
            &trusted(),
            &Method::POST,
            &headers(&[(SEC_FETCH_SITE, "same-origin")])
        ));
        assert!(is_allowed(
            &trusted(),
            &Method::POST,
            &headers(&[(SEC_FETCH_SITE, "none")])
        ));
        assert!(!is_allowed(
            &trusted(),
            &Method::POST,
            &headers(&[(SEC_FETCH_SITE, "same-site")])
        ));
    }

    #[test]
    fn non_browser_requests_pass() {
        assert!(is_allowed(&trusted(), &Method::POST, &HeaderMap::new()));
    }

    #[test]
    fn origin_must_match_host_without_fetch_metadata() {
        let same = headers(&[("origin", "http://api.baduk.online:8080"), ("host", "api.baduk.online:8080")]);
        assert!(is_allowed(&trusted(), &Method::POST, &same));

        let other = headers(&[("origin", "https://evil.example"), ("host", "api.baduk.online")]);
        assert!(!is_allowed(&trusted(), &Method::POST, &other));

        let opaque = headers(&[("origin", "null"), ("host", "api.baduk.online")]);
        assert!(!is_allowed(&trusted(), &Method::POST, &opaque));
    }
}
