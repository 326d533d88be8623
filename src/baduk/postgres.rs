//! Postgres-backed stores. Schema lives in `sql/schema.sql`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, Connection, PgPool, Row};
use std::{
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{info_span, Instrument, Span};

use super::{
    health::Probe,
    store::{
        Account, AccountStore, NewAccount, SessionHandle, SessionStore, StoreError, StoreResult,
        TokenStore,
    },
};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

const ACCOUNT_COLUMNS: &str = "id, EXTRACT(EPOCH FROM created_at)::BIGINT AS created_at, name, \
     email, password_hash, validated, version";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn query_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        validated: row.try_get("validated")?,
        version: row.try_get("version")?,
    })
}

/// All three stores over one pool; every call is bounded by `timeout`.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // Dropping the future on timeout rolls back any open transaction.
    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

fn backend(err: sqlx::Error, context: &'static str) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err).context(context))
}

#[async_trait]
impl AccountStore for PgStore {
    async fn insert(&self, account: NewAccount) -> StoreResult<Account> {
        let query = format!(
            "INSERT INTO users (name, email, password_hash) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        self.bounded(async {
            let row = sqlx::query(&query)
                .bind(&account.name)
                .bind(&account.email)
                .bind(&account.password_hash)
                .fetch_one(&self.pool)
                .instrument(query_span("INSERT", &query))
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        StoreError::DuplicateKey
                    } else {
                        backend(err, "failed to insert user")
                    }
                })?;
            Ok(account_from_row(&row)?)
        })
        .await
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Account> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE email = $1");
        self.bounded(async {
            let row = sqlx::query(&query)
                .bind(email)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", &query))
                .await
                .map_err(|err| backend(err, "failed to lookup user by email"))?
                .ok_or(StoreError::NotFound)?;
            Ok(account_from_row(&row)?)
        })
        .await
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Account> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1");
        self.bounded(async {
            let row = sqlx::query(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", &query))
                .await
                .map_err(|err| backend(err, "failed to lookup user by id"))?
                .ok_or(StoreError::NotFound)?;
            Ok(account_from_row(&row)?)
        })
        .await
    }

    async fn update(&self, account: &Account) -> StoreResult<Account> {
        let query = "UPDATE users SET name = $1, email = $2, password_hash = $3, validated = $4, \
                     version = version + 1 WHERE id = $5 AND version = $6 RETURNING version";
        self.bounded(async {
            let row = sqlx::query(query)
                .bind(&account.name)
                .bind(&account.email)
                .bind(&account.password_hash)
                .bind(account.validated)
                .bind(account.id)
                .bind(account.version)
                .fetch_optional(&self.pool)
                .instrument(query_span("UPDATE", query))
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        StoreError::DuplicateKey
                    } else {
                        backend(err, "failed to update user")
                    }
                })?
                .ok_or(StoreError::EditConflict)?;
            let mut updated = account.clone();
            updated.version = row
                .try_get("version")
                .map_err(|err| backend(err, "failed to read user version"))?;
            Ok(updated)
        })
        .await
    }

    async fn mark_validated(&self, account: &Account) -> StoreResult<Account> {
        let update = format!(
            "UPDATE users SET validated = TRUE, version = version + 1 \
             WHERE id = $1 AND version = $2 RETURNING {ACCOUNT_COLUMNS}"
        );
        let delete = "DELETE FROM registration WHERE user_id = $1";
        self.bounded(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| backend(err, "begin activation transaction"))?;

            let row = sqlx::query(&update)
                .bind(account.id)
                .bind(account.version)
                .fetch_optional(&mut *tx)
                .instrument(query_span("UPDATE", &update))
                .await
                .map_err(|err| backend(err, "failed to mark user validated"))?
                .ok_or(StoreError::EditConflict)?;
            let validated = account_from_row(&row)?;

            sqlx::query(delete)
                .bind(account.id)
                .execute(&mut *tx)
                .instrument(query_span("DELETE", delete))
                .await
                .map_err(|err| backend(err, "failed to revoke registration tokens"))?;

            tx.commit()
                .await
                .map_err(|err| backend(err, "commit activation transaction"))?;
            Ok(validated)
        })
        .await
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert(&self, hash: &[u8], owner_id: i64, expiry: SystemTime) -> StoreResult<()> {
        let query =
            "INSERT INTO registration (hash, user_id, expiry) VALUES ($1, $2, to_timestamp($3))";
        self.bounded(async {
            sqlx::query(query)
                .bind(hash)
                .bind(owner_id)
                .bind(unix_seconds(expiry))
                .execute(&self.pool)
                .instrument(query_span("INSERT", query))
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        StoreError::DuplicateKey
                    } else {
                        backend(err, "failed to insert registration token")
                    }
                })?;
            Ok(())
        })
        .await
    }

    async fn delete_all_for_owner(&self, owner_id: i64) -> StoreResult<()> {
        let query = "DELETE FROM registration WHERE user_id = $1";
        self.bounded(async {
            sqlx::query(query)
                .bind(owner_id)
                .execute(&self.pool)
                .instrument(query_span("DELETE", query))
                .await
                .map_err(|err| backend(err, "failed to revoke registration tokens"))?;
            Ok(())
        })
        .await
    }

    async fn find_by_hash(&self, hash: &[u8], now: SystemTime) -> StoreResult<i64> {
        let query = "SELECT user_id FROM registration WHERE hash = $1 AND expiry > to_timestamp($2)";
        self.bounded(async {
            let row = sqlx::query(query)
                .bind(hash)
                .bind(unix_seconds(now))
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .map_err(|err| backend(err, "failed to lookup registration token"))?
                .ok_or(StoreError::NotFound)?;
            row.try_get("user_id")
                .map_err(|err| backend(err, "failed to read token owner"))
        })
        .await
    }

    async fn replace_for_owner(
        &self,
        hash: &[u8],
        owner_id: i64,
        expiry: SystemTime,
    ) -> StoreResult<()> {
        let delete = "DELETE FROM registration WHERE user_id = $1";
        let insert =
            "INSERT INTO registration (hash, user_id, expiry) VALUES ($1, $2, to_timestamp($3))";
        self.bounded(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| backend(err, "begin token swap transaction"))?;

            sqlx::query(delete)
                .bind(owner_id)
                .execute(&mut *tx)
                .instrument(query_span("DELETE", delete))
                .await
                .map_err(|err| backend(err, "failed to revoke registration tokens"))?;

            sqlx::query(insert)
                .bind(hash)
                .bind(owner_id)
                .bind(unix_seconds(expiry))
                .execute(&mut *tx)
                .instrument(query_span("INSERT", insert))
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        StoreError::DuplicateKey
                    } else {
                        backend(err, "failed to insert registration token")
                    }
                })?;

            tx.commit()
                .await
                .map_err(|err| backend(err, "commit token swap transaction"))?;
            Ok(())
        })
        .await
    }
}

/// Sessions keyed by the handle digest, with an absolute lifetime.
#[derive(Clone, Debug)]
pub struct PgSessionStore {
    store: PgStore,
    ttl: Duration,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(store: PgStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, handle: &SessionHandle, key: &str) -> StoreResult<Option<String>> {
        let query = "SELECT data ->> $2 AS value FROM sessions \
                     WHERE handle_hash = $1 AND expires_at > NOW()";
        self.store
            .bounded(async {
                let row = sqlx::query(query)
                    .bind(handle.digest())
                    .bind(key)
                    .fetch_optional(&self.store.pool)
                    .instrument(query_span("SELECT", query))
                    .await
                    .map_err(|err| backend(err, "failed to read session"))?;
                match row {
                    Some(row) => row
                        .try_get::<Option<String>, _>("value")
                        .map_err(|err| backend(err, "failed to decode session value")),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn put(&self, handle: &SessionHandle, key: &str, value: &str) -> StoreResult<()> {
        // An expired row is replaced wholesale instead of extended.
        let query = "INSERT INTO sessions (handle_hash, data, expires_at) \
                     VALUES ($1, jsonb_build_object($2::text, $3::text), \
                             NOW() + make_interval(secs => $4)) \
                     ON CONFLICT (handle_hash) DO UPDATE SET \
                       data = CASE WHEN sessions.expires_at > NOW() \
                                   THEN sessions.data || EXCLUDED.data \
                                   ELSE EXCLUDED.data END, \
                       expires_at = CASE WHEN sessions.expires_at > NOW() \
                                         THEN sessions.expires_at \
                                         ELSE EXCLUDED.expires_at END";
        self.store
            .bounded(async {
                sqlx::query(query)
                    .bind(handle.digest())
                    .bind(key)
                    .bind(value)
                    .bind(self.ttl.as_secs_f64())
                    .execute(&self.store.pool)
                    .instrument(query_span("INSERT", query))
                    .await
                    .map_err(|err| backend(err, "failed to write session"))?;
                Ok(())
            })
            .await
    }

    async fn destroy(&self, handle: &SessionHandle) -> StoreResult<()> {
        let query = "DELETE FROM sessions WHERE handle_hash = $1";
        self.store
            .bounded(async {
                sqlx::query(query)
                    .bind(handle.digest())
                    .execute(&self.store.pool)
                    .instrument(query_span("DELETE", query))
                    .await
                    .map_err(|err| backend(err, "failed to destroy session"))?;
                Ok(())
            })
            .await
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let query = "DELETE FROM sessions WHERE expires_at <= NOW()";
        self.store
            .bounded(async {
                let result = sqlx::query(query)
                    .execute(&self.store.pool)
                    .instrument(query_span("DELETE", query))
                    .await
                    .map_err(|err| backend(err, "failed to purge expired sessions"))?;
                Ok(result.rows_affected())
            })
            .await
    }
}

/// Database reachability for the health cache.
pub struct PgProbe {
    pool: PgPool,
}

impl PgProbe {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Probe for PgProbe {
    fn name(&self) -> &str {
        "db"
    }

    async fn ping(&self) -> Result<()> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;

        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping()
            .instrument(ping_span)
            .await
            .map_err(|err| anyhow!("failed to ping database: {err}"))
    }
}
