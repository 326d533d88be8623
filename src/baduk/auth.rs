//! Login, registration and activation over pluggable stores.
//!
//! A session is either anonymous or names exactly one account (by email). Every
//! operation that cares about the current session first classifies it as an
//! [`ExistingSession`] and branches once on that.

use anyhow::Context;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    background::Background,
    error::{ApiError, MSG_ALREADY_ACTIVATED, MSG_DIFFERENT_USER, MSG_DUPLICATE_EMAIL},
    password::{hash_password_blocking, verify_password_blocking},
    store::{
        Account, AccountStore, Mailer, NewAccount, PublicAccount, SessionHandle, SessionStore,
        StoreError, StoreResult,
    },
    token::{RegistrationTokens, TokenError},
    validator::{
        normalize_email, validate_activation_token, validate_email, validate_name,
        validate_password, Validator,
    },
};

/// Session key holding the authenticated account's email.
pub const SESSION_USER_KEY: &str = "email";

const DEFAULT_TOKEN_TTL_SECONDS: u64 = 30 * 60;
const DEFAULT_SESSION_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_MAIL_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_SESSION_SWEEP_SECONDS: u64 = 5 * 60;
const DEFAULT_FRONTEND_BASE_URL: &str = "https://play.baduk.online";

const MSG_BAD_CREDENTIALS: &str = "invalid email or password";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    token_ttl_seconds: u64,
    session_ttl_seconds: u64,
    mail_timeout_seconds: u64,
    session_sweep_seconds: u64,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            mail_timeout_seconds: DEFAULT_MAIL_TIMEOUT_SECONDS,
            session_sweep_seconds: DEFAULT_SESSION_SWEEP_SECONDS,
        }
    }

    #[must_use]
    pub fn with_token_ttl_seconds(mut self, seconds: u64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: u64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_mail_timeout_seconds(mut self, seconds: u64) -> Self {
        self.mail_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_sweep_seconds(mut self, seconds: u64) -> Self {
        self.session_sweep_seconds = seconds;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> u64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn mail_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_timeout_seconds)
    }

    /// How often expired sessions are purged from the store.
    #[must_use]
    pub fn session_sweep_period(&self) -> Duration {
        Duration::from_secs(self.session_sweep_seconds)
    }

    /// Cookies only get `Secure` when the frontend is served over HTTPS.
    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        Url::parse(&self.frontend_base_url).is_ok_and(|url| url.scheme() == "https")
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FRONTEND_BASE_URL.to_string())
    }
}

/// How the current session relates to the account a request is about.
#[derive(Debug, PartialEq, Eq)]
pub enum ExistingSession {
    NoSession,
    SameUser(PublicAccount),
    DifferentUser,
}

/// Result of a successful login.
#[derive(Debug)]
pub struct LoginOutcome {
    pub account: PublicAccount,
    /// Set when a new session was started and the client must store a new cookie.
    pub new_session: Option<SessionHandle>,
}

#[derive(Debug)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
}

pub struct AuthService {
    accounts: Arc<dyn AccountStore>,
    sessions: Arc<dyn SessionStore>,
    tokens: RegistrationTokens,
    mailer: Arc<dyn Mailer>,
    background: Background,
    config: AuthConfig,
}

impl AuthService {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<dyn SessionStore>,
        tokens: RegistrationTokens,
        mailer: Arc<dyn Mailer>,
        background: Background,
        config: AuthConfig,
    ) -> Self {
        Self {
            accounts,
            sessions,
            tokens,
            mailer,
            background,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn background(&self) -> &Background {
        &self.background
    }

    /// Email bound to `session`, if any.
    ///
    /// # Errors
    /// Returns an error if the session store fails.
    pub async fn session_email(
        &self,
        session: Option<&SessionHandle>,
    ) -> Result<Option<String>, ApiError> {
        let Some(handle) = session else {
            return Ok(None);
        };
        Ok(self.sessions.get(handle, SESSION_USER_KEY).await?)
    }

    /// Classify `session` against `email`.
    ///
    /// # Errors
    /// Returns an error if a store fails.
    pub async fn existing_session(
        &self,
        session: Option<&SessionHandle>,
        email: &str,
    ) -> Result<ExistingSession, ApiError> {
        let Some(current) = self.session_email(session).await? else {
            return Ok(ExistingSession::NoSession);
        };
        let account = match self.accounts.get_by_email(&current).await {
            Ok(account) => account,
            // Account vanished under a live session; treat it as anonymous.
            Err(StoreError::NotFound) => return Ok(ExistingSession::NoSession),
            Err(err) => return Err(err.into()),
        };
        if account.email == email {
            Ok(ExistingSession::SameUser(PublicAccount::from(&account)))
        } else {
            Ok(ExistingSession::DifferentUser)
        }
    }

    /// # Errors
    /// Validation for bad input or credentials, Conflict when another account
    /// owns the session, Internal for store failures.
    #[instrument(skip(self, session, password))]
    pub async fn login(
        &self,
        session: Option<&SessionHandle>,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome, ApiError> {
        let email = normalize_email(email);

        match self.existing_session(session, &email).await? {
            ExistingSession::SameUser(account) => {
                debug!("already logged in");
                return Ok(LoginOutcome {
                    account,
                    new_session: None,
                });
            }
            ExistingSession::DifferentUser => {
                return Err(ApiError::Conflict(MSG_DIFFERENT_USER.to_string()));
            }
            ExistingSession::NoSession => {}
        }

        let mut v = Validator::new();
        validate_email(&mut v, &email);
        validate_password(&mut v, password);
        if !v.valid() {
            return Err(ApiError::Validation(v.into_errors()));
        }

        let account = match self.accounts.get_by_email(&email).await {
            Ok(account) => account,
            Err(StoreError::NotFound) => {
                debug!("login for unknown email");
                return Err(ApiError::validation("email", MSG_BAD_CREDENTIALS));
            }
            Err(err) => return Err(err.into()),
        };

        let matches =
            verify_password_blocking(password.to_string(), account.password_hash.clone()).await?;
        if !matches {
            debug!("password mismatch");
            return Err(ApiError::validation("email", MSG_BAD_CREDENTIALS));
        }

        // Rotate: never promote a pre-existing anonymous handle.
        if let Some(old) = session {
            self.sessions.destroy(old).await?;
        }
        let handle = SessionHandle::generate()?;
        self.sessions
            .put(&handle, SESSION_USER_KEY, &account.email)
            .await?;

        info!("user logged in");
        Ok(LoginOutcome {
            account: PublicAccount::from(&account),
            new_session: Some(handle),
        })
    }

    /// Idempotent; a missing or already destroyed session is fine.
    ///
    /// # Errors
    /// Returns an error if the session store fails.
    #[instrument(skip_all)]
    pub async fn logout(&self, session: Option<&SessionHandle>) -> Result<(), ApiError> {
        let Some(handle) = session else {
            return Ok(());
        };
        let email = self.sessions.get(handle, SESSION_USER_KEY).await?;
        self.sessions.destroy(handle).await?;
        if let Some(email) = email {
            info!(email = %email, "user logged out");
        }
        Ok(())
    }

    /// Create an unvalidated account and send its activation email in the background.
    ///
    /// # Errors
    /// Validation for bad input, Conflict for a taken email, Internal otherwise.
    #[instrument(skip(self, registration), fields(email = %registration.email))]
    pub async fn register(&self, registration: Registration) -> Result<PublicAccount, ApiError> {
        let name = registration.name.trim().to_string();
        let email = normalize_email(&registration.email);

        let mut v = Validator::new();
        validate_name(&mut v, &name);
        validate_email(&mut v, &email);
        validate_password(&mut v, &registration.password);
        if !v.valid() {
            return Err(ApiError::Validation(v.into_errors()));
        }

        let password_hash = hash_password_blocking(registration.password).await?;
        let account = match self
            .accounts
            .insert(NewAccount {
                name,
                email,
                password_hash,
            })
            .await
        {
            Ok(account) => account,
            Err(StoreError::DuplicateKey) => {
                return Err(ApiError::Conflict(MSG_DUPLICATE_EMAIL.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        info!(user_id = account.id, "account created");

        let profile = PublicAccount::from(&account);
        let tokens = self.tokens.clone();
        let mailer = Arc::clone(&self.mailer);
        let timeout = self.config.mail_timeout();
        let owner_id = account.id;
        let notice_for = profile.clone();
        self.background
            .spawn("registration_email", &account.email, async move {
                let token = tokens
                    .issue(owner_id)
                    .await
                    .context("failed to issue activation token")?;
                with_mail_timeout(
                    timeout,
                    mailer.send_registration_notice(&notice_for, &token.plaintext),
                )
                .await
            });

        Ok(profile)
    }

    /// Revoke outstanding tokens of the session's account and mail a new one.
    ///
    /// # Errors
    /// Unauthenticated without a session, Conflict if already activated.
    #[instrument(skip_all)]
    pub async fn resend_activation(
        &self,
        session: Option<&SessionHandle>,
    ) -> Result<PublicAccount, ApiError> {
        let account = self.session_account(session).await?;
        if account.validated {
            return Err(ApiError::Conflict(MSG_ALREADY_ACTIVATED.to_string()));
        }

        let token = self.tokens.issue(account.id).await?;
        let profile = PublicAccount::from(&account);

        let mailer = Arc::clone(&self.mailer);
        let timeout = self.config.mail_timeout();
        let notice_for = profile.clone();
        self.background
            .spawn("registration_email", &account.email, async move {
                with_mail_timeout(
                    timeout,
                    mailer.send_registration_notice(&notice_for, &token.plaintext),
                )
                .await
            });

        info!(user_id = account.id, "activation email re-sent");
        Ok(profile)
    }

    /// Consume an activation token. The account flips to validated and loses
    /// every token in one store call, so a failure leaves the token usable.
    ///
    /// # Errors
    /// Validation for malformed, unknown or expired tokens, EditConflict if the
    /// account changed concurrently.
    #[instrument(skip_all)]
    pub async fn activate(&self, token: &str) -> Result<PublicAccount, ApiError> {
        let mut v = Validator::new();
        validate_activation_token(&mut v, token);
        if !v.valid() {
            return Err(ApiError::Validation(v.into_errors()));
        }

        let owner_id = match self.tokens.resolve(token).await {
            Ok(owner_id) => owner_id,
            Err(TokenError::NotFound) => {
                warn!(
                    token_prefix = token.get(..4).unwrap_or_default(),
                    "activation with unknown or expired token"
                );
                return Err(TokenError::NotFound.into());
            }
            Err(err) => return Err(err.into()),
        };

        let account = match self.accounts.get_by_id(owner_id).await {
            Ok(account) => account,
            // Token outlived its account; same answer as an unknown token.
            Err(StoreError::NotFound) => return Err(TokenError::NotFound.into()),
            Err(err) => return Err(err.into()),
        };

        let account = self.accounts.mark_validated(&account).await?;

        info!(user_id = account.id, "account activated");

        let profile = PublicAccount::from(&account);
        let mailer = Arc::clone(&self.mailer);
        let timeout = self.config.mail_timeout();
        let notice_for = profile.clone();
        self.background
            .spawn("activation_email", &account.email, async move {
                with_mail_timeout(timeout, mailer.send_activation_notice(&notice_for)).await
            });

        Ok(profile)
    }

    /// # Errors
    /// Unauthenticated when the session names no (existing) account.
    pub async fn current_user(
        &self,
        session: Option<&SessionHandle>,
    ) -> Result<PublicAccount, ApiError> {
        let account = self.session_account(session).await?;
        Ok(PublicAccount::from(&account))
    }

    async fn session_account(&self, session: Option<&SessionHandle>) -> Result<Account, ApiError> {
        let Some(email) = self.session_email(session).await? else {
            return Err(ApiError::Unauthenticated);
        };
        let account: StoreResult<Account> = self.accounts.get_by_email(&email).await;
        match account {
            Ok(account) => Ok(account),
            Err(StoreError::NotFound) => Err(ApiError::Unauthenticated),
            Err(err) => Err(err.into()),
        }
    }
}

async fn with_mail_timeout<F>(timeout: Duration, send: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tokio::time::timeout(timeout, send)
        .await
        .context("mail delivery timed out")?
}
