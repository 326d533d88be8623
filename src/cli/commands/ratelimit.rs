use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use crate::baduk::{ratelimit::RateLimitPolicy, RateLimitSettings};

pub const ARG_RATELIMIT_SWEEP_SECONDS: &str = "ratelimit-sweep-seconds";

struct PolicyArgs {
    limit: &'static str,
    window: &'static str,
    limit_env: &'static str,
    window_env: &'static str,
    default_limit: &'static str,
    default_window: &'static str,
}

const CREATE_USER: PolicyArgs = PolicyArgs {
    limit: "create-user-limit",
    window: "create-user-window-seconds",
    limit_env: "BADUK_CREATE_USER_LIMIT",
    window_env: "BADUK_CREATE_USER_WINDOW_SECONDS",
    default_limit: "10",
    default_window: "3600",
};

const ACTIVATE: PolicyArgs = PolicyArgs {
    limit: "activate-limit",
    window: "activate-window-seconds",
    limit_env: "BADUK_ACTIVATE_LIMIT",
    window_env: "BADUK_ACTIVATE_WINDOW_SECONDS",
    default_limit: "10",
    default_window: "3600",
};

const LOGIN: PolicyArgs = PolicyArgs {
    limit: "login-limit",
    window: "login-window-seconds",
    limit_env: "BADUK_LOGIN_LIMIT",
    window_env: "BADUK_LOGIN_WINDOW_SECONDS",
    default_limit: "10",
    default_window: "900",
};

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub settings: RateLimitSettings,
}

impl Options {
    /// Parse the per-action policies.
    ///
    /// # Errors
    /// Returns an error if a limit or window is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let policy = |args: &PolicyArgs| -> anyhow::Result<RateLimitPolicy> {
            let (limit_id, window_id) = (args.limit, args.window);

            let limit = matches
                .get_one::<usize>(limit_id)
                .copied()
                .filter(|value| *value > 0)
                .ok_or_else(|| anyhow::anyhow!("--{limit_id} must be at least 1"))?;
            let window = matches
                .get_one::<u64>(window_id)
                .copied()
                .filter(|value| *value > 0)
                .ok_or_else(|| anyhow::anyhow!("--{window_id} must be at least 1"))?;

            Ok(RateLimitPolicy::new(limit, Duration::from_secs(window)))
        };

        let sweep = matches
            .get_one::<u64>(ARG_RATELIMIT_SWEEP_SECONDS)
            .copied()
            .filter(|value| *value > 0)
            .ok_or_else(|| anyhow::anyhow!("--{ARG_RATELIMIT_SWEEP_SECONDS} must be at least 1"))?;

        Ok(Self {
            settings: RateLimitSettings {
                create_user: policy(&CREATE_USER)?,
                activate: policy(&ACTIVATE)?,
                login: policy(&LOGIN)?,
                sweep_period: Duration::from_secs(sweep),
            },
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_policy_args(command, &CREATE_USER, "account creation");
    let command = with_policy_args(command, &ACTIVATE, "activation");
    let command = with_policy_args(command, &LOGIN, "login");

    command.arg(
        Arg::new(ARG_RATELIMIT_SWEEP_SECONDS)
            .long(ARG_RATELIMIT_SWEEP_SECONDS)
            .help("How often idle clients are dropped from the limiter tables")
            .env("BADUK_RATELIMIT_SWEEP_SECONDS")
            .default_value("60")
            .value_parser(clap::value_parser!(u64)),
    )
}

fn with_policy_args(command: Command, args: &PolicyArgs, action: &str) -> Command {
    command
        .arg(
            Arg::new(args.limit)
                .long(args.limit)
                .help(format!("Requests allowed per client and window for {action}"))
                .env(args.limit_env)
                .default_value(args.default_limit)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(args.window)
                .long(args.window)
                .help(format!("Sliding window length in seconds for {action}"))
                .env(args.window_env)
                .default_value(args.default_window)
                .value_parser(clap::value_parser!(u64)),
        )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        with_args(Command::new("baduk")).get_matches_from(args)
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("BADUK_LOGIN_LIMIT", None::<&str>),
                ("BADUK_LOGIN_WINDOW_SECONDS", None),
                ("BADUK_CREATE_USER_LIMIT", None),
                ("BADUK_RATELIMIT_SWEEP_SECONDS", None),
            ],
            || {
                let options = Options::parse(&matches(&["baduk"])).unwrap();
                let defaults = RateLimitSettings::default();
                assert_eq!(options.settings.create_user, defaults.create_user);
                assert_eq!(options.settings.activate, defaults.activate);
                assert_eq!(options.settings.login, defaults.login);
                assert_eq!(options.settings.sweep_period, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("BADUK_LOGIN_LIMIT", Some("3")),
                ("BADUK_LOGIN_WINDOW_SECONDS", Some("30")),
            ],
            || {
                let options = Options::parse(&matches(&["baduk"])).unwrap();
                assert_eq!(
                    options.settings.login,
                    RateLimitPolicy::new(3, Duration::from_secs(30))
                );
            },
        );
    }

    #[test]
    fn test_zero_limit_rejected() {
        temp_env::with_vars([("BADUK_ACTIVATE_LIMIT", None::<&str>)], || {
            let err = Options::parse(&matches(&["baduk", "--activate-limit", "0"])).unwrap_err();
            assert!(err.to_string().contains("--activate-limit"));
        });
    }
}
