//! Outbound notifications: the activation link after registration and the
//! confirmation once an account is activated.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{info, warn};

use super::store::{Mailer, PublicAccount};

pub const DEFAULT_MAIL_FROM: &str = "baduk.online <no-reply@baduk.online>";
const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

const REGISTRATION_SUBJECT: &str = "Please verify your baduk.online account";
const ACTIVATED_SUBJECT: &str = "Your baduk.online account has been activated!";

/// Build the frontend activation link included in the registration email.
#[must_use]
pub fn build_activation_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/activate?code={token}")
}

fn html_escape(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#x27;"),
            _ => output.push(c),
        }
    }
    output
}

/// A rendered notification, ready to be wrapped in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: &'static str,
    pub html: String,
    pub text: String,
}

#[must_use]
pub fn registration_email(account: &PublicAccount, activation_url: &str) -> EmailContent {
    let name = html_escape(&account.name);
    let url = html_escape(activation_url);

    let html = format!(
        "<!doctype html>\n<html>\n<body>\n\
         <p>Hi {name},</p>\n\
         <p>Thanks for signing up for baduk.online. Confirm your email address to activate your account:</p>\n\
         <p><a href=\"{url}\">Activate my account</a></p>\n\
         <p>The link works once and expires shortly. If you did not sign up, ignore this email.</p>\n\
         </body>\n</html>\n"
    );
    let text = format!(
        "Hi {},\n\n\
         Thanks for signing up for baduk.online. Open this link to activate your account:\n\n\
         {activation_url}\n\n\
         The link works once and expires shortly. If you did not sign up, ignore this email.\n",
        account.name
    );

    EmailContent {
        subject: REGISTRATION_SUBJECT,
        html,
        text,
    }
}

#[must_use]
pub fn activated_email(account: &PublicAccount, frontend_base_url: &str) -> EmailContent {
    let name = html_escape(&account.name);
    let base = frontend_base_url.trim_end_matches('/');
    let link = html_escape(base);

    let html = format!(
        "<!doctype html>\n<html>\n<body>\n\
         <p>Hi {name},</p>\n\
         <p>Your baduk.online account is active. See you on the board:</p>\n\
         <p><a href=\"{link}\">{link}</a></p>\n\
         </body>\n</html>\n"
    );
    let text = format!(
        "Hi {},\n\nYour baduk.online account is active. See you on the board:\n\n{base}\n",
        account.name
    );

    EmailContent {
        subject: ACTIVATED_SUBJECT,
        html,
        text,
    }
}

/// SMTP relay configuration.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub from: String,
    /// Plain SMTP without TLS, local relays only.
    pub insecure: bool,
}

/// Delivers notifications through an SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    frontend_base_url: String,
}

impl SmtpMailer {
    /// # Errors
    /// Returns an error for an unusable relay host, a malformed sender or
    /// half-specified credentials.
    pub fn new(settings: &SmtpSettings, frontend_base_url: String) -> Result<Self> {
        let from: Mailbox = settings
            .from
            .parse()
            .with_context(|| format!("Invalid sender address: {}", settings.from))?;

        let credentials = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => Some(Credentials::new(
                username.clone(),
                password.expose_secret().to_string(),
            )),
            (None, None) => None,
            _ => bail!("SMTP username and password must both be provided or both be empty"),
        };

        let builder = if settings.insecure {
            warn!(
                host = %settings.host,
                port = settings.port,
                "Using unencrypted SMTP, only use for local development"
            );
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(settings.host.as_str())
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .with_context(|| format!("Failed to create SMTP transport for {}", settings.host))?
        };
        let builder = builder.port(settings.port).timeout(Some(SMTP_TIMEOUT));
        let transport = match credentials {
            Some(credentials) => builder.credentials(credentials).build(),
            None => builder.build(),
        };

        Ok(Self {
            transport,
            from,
            frontend_base_url,
        })
    }

    fn message(&self, to: &str, content: EmailContent) -> Result<Message> {
        let to: Mailbox = to
            .parse()
            .with_context(|| format!("Invalid recipient address: {to}"))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(content.subject)
            .multipart(MultiPart::alternative_plain_html(content.text, content.html))
            .context("Failed to build email message")
    }

    async fn deliver(&self, to: &str, content: EmailContent) -> Result<()> {
        let subject = content.subject;
        let message = self.message(to, content)?;
        self.transport
            .send(message)
            .await
            .context("Failed to send email")?;
        info!(to_email = %to, subject, "email sent");
        Ok(())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_registration_notice(&self, account: &PublicAccount, token: &str) -> Result<()> {
        let url = build_activation_url(&self.frontend_base_url, token);
        self.deliver(&account.email, registration_email(account, &url))
            .await
    }

    async fn send_activation_notice(&self, account: &PublicAccount) -> Result<()> {
        self.deliver(
            &account.email,
            activated_email(account, &self.frontend_base_url),
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        if self
            .transport
            .test_connection()
            .await
            .context("SMTP relay unreachable")?
        {
            Ok(())
        } else {
            Err(anyhow!("SMTP relay rejected the connection test"))
        }
    }
}

/// Development mailer for `--in-memory` runs: logs instead of sending, and
/// never writes more than a token prefix.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_registration_notice(&self, account: &PublicAccount, token: &str) -> Result<()> {
        info!(
            to_email = %account.email,
            template = "registration",
            token_prefix = token.get(..4).unwrap_or_default(),
            "email send stub"
        );
        Ok(())
    }

    async fn send_activation_notice(&self, account: &PublicAccount) -> Result<()> {
        info!(
            to_email = %account.email,
            template = "activated",
            "email send stub"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
