#![allow(clippy::needless_for_each)]

#[allow(unused_imports)]
use self::handlers::{
    health::{self as health_handler, __path_health},
    session::{self, __path_login, __path_logout},
    users::{self, __path_activate_user, __path_create_user, __path_current_user, __path_resend_activation},
    AppState,
};
use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method, Request},
    middleware,
    routing::{get, post, put},
    Extension, Router,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa::OpenApi;

pub mod auth;
pub mod background;
pub mod cross_origin;
pub mod email;
pub mod error;
pub mod handlers;
pub mod health;
pub mod memory;
pub mod password;
pub mod postgres;
pub mod ratelimit;
pub mod store;
pub mod token;
pub mod validator;

use self::{
    auth::{AuthConfig, AuthService},
    background::Background,
    cross_origin::TrustedOrigins,
    email::{LogMailer, SmtpMailer, SmtpSettings},
    health::{HealthCache, MailerProbe, Probe},
    memory::{MemoryAccountStore, MemoryProbe, MemorySessionStore, MemoryTokenStore},
    postgres::{PgProbe, PgSessionStore, PgStore},
    ratelimit::{RateLimitPolicy, RateLimits},
    store::{AccountStore, Mailer, SessionStore, TokenStore},
    token::RegistrationTokens,
};

#[derive(OpenApi)]
#[openapi(
    paths(health, create_user, resend_activation, activate_user, current_user, login, logout),
    components(
        schemas(
            health_handler::Health,
            handlers::CreateUserRequest,
            handlers::LoginRequest,
            handlers::ActivateRequest,
            handlers::MessageResponse,
            store::PublicAccount,
        )
    ),
    tags(
        (name = "health", description = "Dependency status"),
        (name = "users", description = "Registration and activation"),
        (name = "session", description = "Cookie sessions"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Where accounts, tokens and sessions live.
pub enum Backend {
    Postgres(SecretString),
    Memory,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres(_) => f.write_str("Postgres(\"[REDACTED]\")"),
            Self::Memory => f.write_str("Memory"),
        }
    }
}

/// Per-action throttling policies plus the idle-visitor sweep period.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitSettings {
    pub create_user: RateLimitPolicy,
    pub activate: RateLimitPolicy,
    pub login: RateLimitPolicy,
    pub sweep_period: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            create_user: RateLimitPolicy::new(10, Duration::from_secs(60 * 60)),
            activate: RateLimitPolicy::new(10, Duration::from_secs(60 * 60)),
            login: RateLimitPolicy::new(10, Duration::from_secs(15 * 60)),
            sweep_period: ratelimit::DEFAULT_SWEEP_PERIOD,
        }
    }
}

#[derive(Debug)]
pub struct Settings {
    pub port: u16,
    pub backend: Backend,
    pub environment: String,
    pub request_timeout: Duration,
    pub health_interval: Duration,
    pub shutdown_grace: Duration,
    pub trusted_origins: Vec<String>,
    pub auth: AuthConfig,
    /// SMTP relay; without one notifications are only logged, which is
    /// accepted for the in-memory backend alone.
    pub mail: Option<SmtpSettings>,
    pub limits: RateLimitSettings,
}

/// The store implementations a server instance runs on.
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub db_probe: Arc<dyn Probe>,
}

impl Stores {
    /// Process-local stores, nothing survives a restart.
    #[must_use]
    pub fn memory(session_ttl: Duration) -> Self {
        let tokens = Arc::new(MemoryTokenStore::new());
        Self {
            accounts: Arc::new(MemoryAccountStore::new(tokens.clone())),
            tokens,
            sessions: Arc::new(MemorySessionStore::new(session_ttl)),
            db_probe: Arc::new(MemoryProbe),
        }
    }

    /// Connect to Postgres.
    /// # Errors
    /// Returns an error if the pool cannot be established
    pub async fn postgres(dsn: &SecretString, session_ttl: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn.expose_secret())
            .await
            .context("Failed to connect to database")?;

        let store = PgStore::new(pool.clone());

        Ok(Self {
            accounts: Arc::new(store.clone()),
            tokens: Arc::new(store.clone()),
            sessions: Arc::new(PgSessionStore::new(store, session_ttl)),
            db_probe: Arc::new(PgProbe::new(pool)),
        })
    }
}

/// Wire stores, mailer and policies into the shared handler state.
#[must_use]
pub fn build_state(
    stores: Stores,
    mailer: Arc<dyn Mailer>,
    config: AuthConfig,
    limits: RateLimits,
    health_interval: Duration,
    environment: String,
) -> AppState {
    let tokens = RegistrationTokens::new(stores.tokens, config.token_ttl());
    let health = HealthCache::new(vec![
        stores.db_probe,
        Arc::new(MailerProbe::new(mailer.clone())) as Arc<dyn Probe>,
    ])
    .with_interval(health_interval);

    AppState {
        auth: AuthService::new(
            stores.accounts,
            stores.sessions,
            tokens,
            mailer,
            Background::new(),
            config,
        ),
        limits,
        health,
        environment,
    }
}

/// Build the HTTP router with the middleware stack. `origins` are both the
/// CORS allow-list and the origins trusted by the cross-origin check.
#[must_use]
pub fn router(state: Arc<AppState>, origins: Vec<HeaderValue>, request_timeout: Duration) -> Router {
    let trusted = TrustedOrigins::new(origins.clone());
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true);

    Router::new()
        .route("/api/v1/health", get(health_handler::health).options(health_handler::health))
        .route("/api/v1/users", post(users::create_user))
        .route("/api/v1/users/register", post(users::resend_activation))
        .route("/api/v1/users/activated", put(users::activate_user))
        .route("/api/v1/users/login", post(session::login))
        .route("/api/v1/users/logout", post(session::logout))
        .route("/api/v1/user", get(users::current_user))
        .layer(middleware::from_fn_with_state(trusted, cross_origin::protect))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(TimeoutLayer::new(request_timeout))
                .layer(cors)
                .layer(Extension(state)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(settings: Settings) -> Result<()> {
    let session_ttl = Duration::from_secs(settings.auth.session_ttl_seconds());

    let stores = match &settings.backend {
        Backend::Postgres(dsn) => Stores::postgres(dsn, session_ttl).await?,
        Backend::Memory => {
            info!("Using in-memory stores, data is lost on restart");
            Stores::memory(session_ttl)
        }
    };

    let mut origins = vec![frontend_origin(settings.auth.frontend_base_url())?];
    for origin in &settings.trusted_origins {
        origins.push(frontend_origin(origin)?);
    }

    let mailer: Arc<dyn Mailer> = match (&settings.mail, &settings.backend) {
        (Some(smtp), _) => Arc::new(SmtpMailer::new(
            smtp,
            settings.auth.frontend_base_url().to_string(),
        )?),
        (None, Backend::Memory) => {
            info!("No SMTP relay configured, notifications are logged only");
            Arc::new(LogMailer)
        }
        (None, Backend::Postgres(_)) => {
            return Err(anyhow!("an SMTP relay is required with the Postgres backend"));
        }
    };

    let limits = RateLimits::from(&settings.limits);
    let mut sweepers = limits.spawn_sweepers(settings.limits.sweep_period);
    sweepers.push(store::spawn_session_sweeper(
        &stores.sessions,
        settings.auth.session_sweep_period(),
    ));

    let state = Arc::new(build_state(
        stores,
        mailer,
        settings.auth,
        limits,
        settings.health_interval,
        settings.environment,
    ));

    let app = router(state.clone(), origins, settings.request_timeout);

    let listener = TcpListener::bind(format!("::0:{}", settings.port)).await?;

    info!("Listening on [::]:{}", settings.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state
        .auth
        .background()
        .shutdown(settings.shutdown_grace)
        .await;

    for sweeper in sweepers {
        sweeper.abort();
    }

    info!("Gracefully shutdown");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

/// Reduce a URL to the `scheme://host[:port]` form browsers send as `Origin`.
/// # Errors
/// Returns an error if the URL has no host
pub fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;

    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;

    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));

    let origin = format!("{}://{}{}", parsed.scheme(), host, port);

    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
