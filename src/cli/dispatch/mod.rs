//! Map validated CLI matches to an action with its full configuration.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{
    auth, mail, ratelimit, ARG_DSN, ARG_ENVIRONMENT, ARG_HEALTH_COALESCE_SECONDS, ARG_IN_MEMORY,
    ARG_PORT, ARG_REQUEST_TIMEOUT_SECONDS, ARG_SHUTDOWN_GRACE_SECONDS, ARG_TRUSTED_ORIGINS,
};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);

    let in_memory = matches.get_flag(ARG_IN_MEMORY);
    let dsn = if in_memory {
        None
    } else {
        Some(
            matches
                .get_one::<String>(ARG_DSN)
                .cloned()
                .map(SecretString::from)
                .context("missing required argument: --dsn")?,
        )
    };

    let seconds = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

    let trusted_origins = matches
        .get_many::<String>(ARG_TRUSTED_ORIGINS)
        .map(|values| {
            values
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let auth_opts = auth::Options::parse(matches)?;
    let mail_opts = mail::Options::parse(matches)?;
    let ratelimit_opts = ratelimit::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        environment: matches
            .get_one::<String>(ARG_ENVIRONMENT)
            .cloned()
            .unwrap_or_else(|| "development".to_string()),
        trusted_origins,
        request_timeout_seconds: seconds(ARG_REQUEST_TIMEOUT_SECONDS, 10),
        health_coalesce_seconds: seconds(ARG_HEALTH_COALESCE_SECONDS, 5),
        shutdown_grace_seconds: seconds(ARG_SHUTDOWN_GRACE_SECONDS, 15),
        frontend_base_url: auth_opts.frontend_base_url,
        token_ttl_seconds: auth_opts.token_ttl_seconds,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        mail_timeout_seconds: auth_opts.mail_timeout_seconds,
        session_sweep_seconds: auth_opts.session_sweep_seconds,
        smtp: mail_opts.smtp,
        rate_limits: ratelimit_opts.settings,
    }))
}
