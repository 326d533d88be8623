use clap::{Arg, ArgMatches, Command};

pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_TOKEN_TTL_SECONDS: &str = "token-ttl-seconds";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_MAIL_TIMEOUT_SECONDS: &str = "mail-timeout-seconds";
pub const ARG_SESSION_SWEEP_SECONDS: &str = "session-sweep-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub frontend_base_url: String,
    pub token_ttl_seconds: u64,
    pub session_ttl_seconds: u64,
    pub mail_timeout_seconds: u64,
    pub session_sweep_seconds: u64,
}

impl Options {
    /// Parse account/session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a value is missing or zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let seconds = |id: &str| -> anyhow::Result<u64> {
            matches
                .get_one::<u64>(id)
                .copied()
                .filter(|value| *value > 0)
                .ok_or_else(|| anyhow::anyhow!("--{id} must be a positive number of seconds"))
        };

        let frontend_base_url = matches
            .get_one::<String>(ARG_FRONTEND_BASE_URL)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_FRONTEND_BASE_URL}"))?;

        Ok(Self {
            frontend_base_url,
            token_ttl_seconds: seconds(ARG_TOKEN_TTL_SECONDS)?,
            session_ttl_seconds: seconds(ARG_SESSION_TTL_SECONDS)?,
            mail_timeout_seconds: seconds(ARG_MAIL_TIMEOUT_SECONDS)?,
            session_sweep_seconds: seconds(ARG_SESSION_SWEEP_SECONDS)?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL used for activation links and CORS")
                .env("BADUK_FRONTEND_BASE_URL")
                .default_value("https://play.baduk.online"),
        )
        .arg(
            Arg::new(ARG_TOKEN_TTL_SECONDS)
                .long(ARG_TOKEN_TTL_SECONDS)
                .help("Activation token TTL in seconds")
                .env("BADUK_TOKEN_TTL_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session cookie TTL in seconds")
                .env("BADUK_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MAIL_TIMEOUT_SECONDS)
                .long(ARG_MAIL_TIMEOUT_SECONDS)
                .help("Upper bound for a single notification send")
                .env("BADUK_MAIL_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_SWEEP_SECONDS)
                .long(ARG_SESSION_SWEEP_SECONDS)
                .help("How often expired sessions are purged")
                .env("BADUK_SESSION_SWEEP_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
