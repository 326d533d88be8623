use crate::{
    baduk::{self, auth::AuthConfig, email::SmtpSettings, Backend, RateLimitSettings, Settings},
    cli::telemetry,
};
use anyhow::Result;
use secrecy::SecretString;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub environment: String,
    pub trusted_origins: Vec<String>,
    pub request_timeout_seconds: u64,
    pub health_coalesce_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub frontend_base_url: String,
    pub token_ttl_seconds: u64,
    pub session_ttl_seconds: u64,
    pub mail_timeout_seconds: u64,
    pub session_sweep_seconds: u64,
    pub smtp: Option<SmtpSettings>,
    pub rate_limits: RateLimitSettings,
}

impl Args {
    #[must_use]
    pub fn into_settings(self) -> Settings {
        let backend = self.dsn.map_or(Backend::Memory, Backend::Postgres);

        let auth = AuthConfig::new(self.frontend_base_url)
            .with_token_ttl_seconds(self.token_ttl_seconds)
            .with_session_ttl_seconds(self.session_ttl_seconds)
            .with_mail_timeout_seconds(self.mail_timeout_seconds)
            .with_session_sweep_seconds(self.session_sweep_seconds);

        Settings {
            port: self.port,
            backend,
            environment: self.environment,
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            health_interval: Duration::from_secs(self.health_coalesce_seconds),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            trusted_origins: self.trusted_origins,
            auth,
            mail: self.smtp,
            limits: self.rate_limits,
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the stores cannot be reached or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let settings = args.into_settings();

    debug!("Server settings: {:?}", settings);

    let result = baduk::new(settings).await;

    telemetry::shutdown_tracer();

    result
}
