//! In-process stores for tests and `--in-memory` development runs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;

use super::{
    health::Probe,
    store::{
        Account, AccountStore, Mailer, NewAccount, PublicAccount, SessionHandle, SessionStore,
        StoreError, StoreResult, TokenStore,
    },
};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

#[derive(Default)]
struct Accounts {
    next_id: i64,
    by_id: HashMap<i64, Account>,
}

/// Accounts plus a handle on the token table, so activation can clear tokens
/// under the same lock that flips `validated`.
pub struct MemoryAccountStore {
    inner: Mutex<Accounts>,
    tokens: Arc<MemoryTokenStore>,
}

impl MemoryAccountStore {
    #[must_use]
    pub fn new(tokens: Arc<MemoryTokenStore>) -> Self {
        Self {
            inner: Mutex::new(Accounts::default()),
            tokens,
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn insert(&self, account: NewAccount) -> StoreResult<Account> {
        let mut inner = self.inner.lock().await;
        if inner.by_id.values().any(|a| a.email == account.email) {
            return Err(StoreError::DuplicateKey);
        }
        inner.next_id += 1;
        let record = Account {
            id: inner.next_id,
            created_at: unix_now(),
            name: account.name,
            email: account.email,
            password_hash: account.password_hash,
            validated: false,
            version: 1,
        };
        inner.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Account> {
        let inner = self.inner.lock().await;
        inner
            .by_id
            .values()
            .find(|a| a.email == email)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Account> {
        let inner = self.inner.lock().await;
        inner.by_id.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update(&self, account: &Account) -> StoreResult<Account> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .by_id
            .get_mut(&account.id)
            .ok_or(StoreError::EditConflict)?;
        if stored.version != account.version {
            return Err(StoreError::EditConflict);
        }
        let mut updated = account.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    // Lock order: accounts, then tokens.
    async fn mark_validated(&self, account: &Account) -> StoreResult<Account> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .by_id
            .get_mut(&account.id)
            .ok_or(StoreError::EditConflict)?;
        if stored.version != account.version {
            return Err(StoreError::EditConflict);
        }
        self.tokens
            .tokens
            .lock()
            .await
            .retain(|_, (owner, _)| *owner != account.id);
        stored.validated = true;
        stored.version += 1;
        Ok(stored.clone())
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<Vec<u8>, (i64, SystemTime)>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens, live or expired.
    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, hash: &[u8], owner_id: i64, expiry: SystemTime) -> StoreResult<()> {
        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(hash) {
            return Err(StoreError::DuplicateKey);
        }
        tokens.insert(hash.to_vec(), (owner_id, expiry));
        Ok(())
    }

    async fn delete_all_for_owner(&self, owner_id: i64) -> StoreResult<()> {
        self.tokens
            .lock()
            .await
            .retain(|_, (owner, _)| *owner != owner_id);
        Ok(())
    }

    async fn find_by_hash(&self, hash: &[u8], now: SystemTime) -> StoreResult<i64> {
        let tokens = self.tokens.lock().await;
        match tokens.get(hash) {
            Some((owner, expiry)) if *expiry > now => Ok(*owner),
            _ => Err(StoreError::NotFound),
        }
    }

    // One lock for both steps so readers never see the owner without a token.
    async fn replace_for_owner(
        &self,
        hash: &[u8],
        owner_id: i64,
        expiry: SystemTime,
    ) -> StoreResult<()> {
        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(hash) {
            return Err(StoreError::DuplicateKey);
        }
        tokens.retain(|_, (owner, _)| *owner != owner_id);
        tokens.insert(hash.to_vec(), (owner_id, expiry));
        Ok(())
    }
}

struct SessionEntry {
    values: HashMap<String, String>,
    expires_at: SystemTime,
}

/// Sessions with an absolute lifetime counted from the first write.
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<Vec<u8>, SessionEntry>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        let now = SystemTime::now();
        self.sessions
            .lock()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, handle: &SessionHandle, key: &str) -> StoreResult<Option<String>> {
        let mut sessions = self.sessions.lock().await;
        let digest = handle.digest();
        let Some(entry) = sessions.get(&digest) else {
            return Ok(None);
        };
        if entry.expires_at <= SystemTime::now() {
            sessions.remove(&digest);
            return Ok(None);
        }
        Ok(entry.values.get(key).cloned())
    }

    async fn put(&self, handle: &SessionHandle, key: &str, value: &str) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let now = SystemTime::now();
        let entry = sessions
            .entry(handle.digest())
            .or_insert_with(|| SessionEntry {
                values: HashMap::new(),
                expires_at: now + self.ttl,
            });
        if entry.expires_at <= now {
            entry.values.clear();
            entry.expires_at = now + self.ttl;
        }
        entry.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn destroy(&self, handle: &SessionHandle) -> StoreResult<()> {
        self.sessions.lock().await.remove(&handle.digest());
        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = SystemTime::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        Ok(u64::try_from(before - sessions.len()).unwrap_or(u64::MAX))
    }
}

/// Something the [`RecordingMailer`] was asked to deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Registration { email: String, token: String },
    Activation { email: String },
}

/// Mailer that keeps every notice in memory; can be switched to fail.
#[derive(Default)]
pub struct RecordingMailer {
    outbox: Mutex<Vec<Notice>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn notices(&self) -> Vec<Notice> {
        self.outbox.lock().await.clone()
    }

    /// Most recent activation token sent to `email`.
    pub async fn last_token_for(&self, email: &str) -> Option<String> {
        self.outbox
            .lock()
            .await
            .iter()
            .rev()
            .find_map(|notice| match notice {
                Notice::Registration { email: to, token } if to == email => Some(token.clone()),
                _ => None,
            })
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(anyhow!("mail relay unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_registration_notice(&self, account: &PublicAccount, token: &str) -> Result<()> {
        self.check_failing()?;
        self.outbox.lock().await.push(Notice::Registration {
            email: account.email.clone(),
            token: token.to_string(),
        });
        Ok(())
    }

    async fn send_activation_notice(&self, account: &PublicAccount) -> Result<()> {
        self.check_failing()?;
        self.outbox.lock().await.push(Notice::Activation {
            email: account.email.clone(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_failing()
    }
}

/// Probe for the in-memory database; always up.
pub struct MemoryProbe;

#[async_trait]
impl Probe for MemoryProbe {
    fn name(&self) -> &str {
        "db"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
