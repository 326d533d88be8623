use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use crate::baduk::email::{SmtpSettings, DEFAULT_MAIL_FROM};

use super::ARG_IN_MEMORY;

pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_USERNAME: &str = "smtp-username";
pub const ARG_SMTP_PASSWORD: &str = "smtp-password";
pub const ARG_SMTP_INSECURE: &str = "smtp-insecure";
pub const ARG_MAIL_FROM: &str = "mail-from";

#[derive(Debug, Clone)]
pub struct Options {
    /// `None` only for in-memory runs, which log notifications instead.
    pub smtp: Option<SmtpSettings>,
}

impl Options {
    /// Parse the SMTP relay arguments.
    ///
    /// # Errors
    /// Returns an error if the host is blank.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let Some(host) = matches.get_one::<String>(ARG_SMTP_HOST) else {
            return Ok(Self { smtp: None });
        };
        let host = host.trim();
        if host.is_empty() {
            anyhow::bail!("--{ARG_SMTP_HOST} must not be empty");
        }

        Ok(Self {
            smtp: Some(SmtpSettings {
                host: host.to_string(),
                port: matches.get_one::<u16>(ARG_SMTP_PORT).copied().unwrap_or(587),
                username: matches.get_one::<String>(ARG_SMTP_USERNAME).cloned(),
                password: matches
                    .get_one::<String>(ARG_SMTP_PASSWORD)
                    .cloned()
                    .map(SecretString::from),
                from: matches
                    .get_one::<String>(ARG_MAIL_FROM)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_MAIL_FROM.to_string()),
                insecure: matches.get_flag(ARG_SMTP_INSECURE),
            }),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay for activation emails")
                .env("BADUK_SMTP_HOST")
                .required_unless_present(ARG_IN_MEMORY),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port")
                .env("BADUK_SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_USERNAME)
                .long(ARG_SMTP_USERNAME)
                .help("SMTP username")
                .env("BADUK_SMTP_USERNAME"),
        )
        .arg(
            Arg::new(ARG_SMTP_PASSWORD)
                .long(ARG_SMTP_PASSWORD)
                .help("SMTP password")
                .env("BADUK_SMTP_PASSWORD")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SMTP_INSECURE)
                .long(ARG_SMTP_INSECURE)
                .help("Talk plain SMTP without TLS (local relays only)")
                .env("BADUK_SMTP_INSECURE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_MAIL_FROM)
                .long(ARG_MAIL_FROM)
                .help("Sender mailbox for notifications")
                .env("BADUK_MAIL_FROM")
                .default_value(DEFAULT_MAIL_FROM),
        )
}
