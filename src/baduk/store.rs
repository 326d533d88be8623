//! Persistence and notification seams.
//!
//! Everything the auth flow touches outside of process memory goes through one
//! of these traits so the service can run against Postgres in production and
//! against [`crate::baduk::memory`] in tests and local development.

use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key")]
    DuplicateKey,
    #[error("record not found")]
    NotFound,
    #[error("record was modified concurrently")]
    EditConflict,
    #[error("store operation timed out")]
    Timeout,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored account, including the secret material that never leaves the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub created_at: i64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub validated: bool,
    pub version: i32,
}

#[derive(Clone, Debug)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

/// Public projection of an account returned by the API.
#[derive(ToSchema, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicAccount {
    pub name: String,
    pub email: String,
    pub validated: bool,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl From<&Account> for PublicAccount {
    fn from(account: &Account) -> Self {
        Self {
            name: account.name.clone(),
            email: account.email.clone(),
            validated: account.validated,
            created_at: account.created_at,
        }
    }
}

/// Opaque session handle carried by the client cookie.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Generate a fresh handle from the OS RNG.
    ///
    /// # Errors
    /// Returns an error if the randomness source is unavailable.
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| anyhow::anyhow!("failed to generate session handle: {err}"))?;
        Ok(Self(Base64UrlUnpadded::encode_string(&bytes)))
    }

    #[must_use]
    pub fn from_cookie(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(Self(value.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Handles are stored hashed so a leaked table cannot be replayed.
    #[must_use]
    pub fn digest(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionHandle({prefix}..)")
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateKey`] when the email is taken.
    async fn insert(&self, account: NewAccount) -> StoreResult<Account>;

    async fn get_by_email(&self, email: &str) -> StoreResult<Account>;

    async fn get_by_id(&self, id: i64) -> StoreResult<Account>;

    /// Optimistic update keyed on `(id, version)`; returns the row with its new version.
    async fn update(&self, account: &Account) -> StoreResult<Account>;

    /// Set `validated` and delete every activation token of the account as one
    /// unit. Keyed on `(id, version)` like [`AccountStore::update`]; on any
    /// error neither the account nor its tokens change.
    async fn mark_validated(&self, account: &Account) -> StoreResult<Account>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, hash: &[u8], owner_id: i64, expiry: SystemTime) -> StoreResult<()>;

    async fn delete_all_for_owner(&self, owner_id: i64) -> StoreResult<()>;

    /// Owner of a live token, [`StoreError::NotFound`] if missing or expired at `now`.
    async fn find_by_hash(&self, hash: &[u8], now: SystemTime) -> StoreResult<i64>;

    /// Revoke every token of `owner_id`, then store the new one.
    async fn replace_for_owner(
        &self,
        hash: &[u8],
        owner_id: i64,
        expiry: SystemTime,
    ) -> StoreResult<()> {
        self.delete_all_for_owner(owner_id).await?;
        self.insert(hash, owner_id, expiry).await
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, handle: &SessionHandle, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, handle: &SessionHandle, key: &str, value: &str) -> StoreResult<()>;

    async fn destroy(&self, handle: &SessionHandle) -> StoreResult<()>;

    /// Delete every session past its expiry; returns how many went.
    async fn purge_expired(&self) -> StoreResult<u64>;
}

/// Periodically purge expired sessions; the task ends once the store is dropped.
#[must_use]
pub fn spawn_session_sweeper(sessions: &Arc<dyn SessionStore>, period: Duration) -> JoinHandle<()> {
    let sessions: Weak<dyn SessionStore> = Arc::downgrade(sessions);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(sessions) = sessions.upgrade() else {
                break;
            };
            match sessions.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "purged expired sessions"),
                Err(err) => warn!(error = %err, "failed to purge expired sessions"),
            }
        }
    })
}

/// Outbound notification sink.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_registration_notice(
        &self,
        account: &PublicAccount,
        token: &str,
    ) -> anyhow::Result<()>;

    async fn send_activation_notice(&self, account: &PublicAccount) -> anyhow::Result<()>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_handle_is_url_safe_and_unique() -> anyhow::Result<()> {
        let first = SessionHandle::generate()?;
        let second = SessionHandle::generate()?;
        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), 43);
        assert!(first
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[test]
    fn session_handle_digest_is_stable() {
        let handle = SessionHandle("abc".to_string());
        assert_eq!(handle.digest(), handle.digest());
        assert_eq!(handle.digest().len(), 32);
    }

    #[test]
    fn session_handle_debug_hides_value() {
        let handle = SessionHandle("supersecretvalue".to_string());
        let rendered = format!("{handle:?}");
        assert!(!rendered.contains("supersecretvalue"));
    }

    #[test]
    fn from_cookie_rejects_blank() {
        assert!(SessionHandle::from_cookie("  ").is_none());
        assert!(SessionHandle::from_cookie("x").is_some());
    }

    #[test]
    fn public_projection_drops_secrets() {
        let account = Account {
            id: 7,
            created_at: 1_700_000_000,
            name: "Lee".to_string(),
            email: "lee@example.com".to_string(),
            password_hash: "$argon2id$...".to_string(),
            validated: true,
            version: 3,
        };
        let public = PublicAccount::from(&account);
        let json = serde_json::to_value(&public).unwrap_or_default();
        assert_eq!(json["email"], "lee@example.com");
        assert_eq!(json["createdAt"], 1_700_000_000);
        assert!(json.get("password_hash").is_none());
        assert!(json.get("version").is_none());
    }
}
