//! Single-use activation tokens.
//!
//! A token is 16 bytes from the OS RNG encoded as unpadded RFC 4648 base32, so
//! the plaintext is always 26 characters. The store only ever sees the SHA-256
//! digest. Expired and missing tokens resolve to the same [`TokenError::NotFound`].

use base32::Alphabet;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, instrument};

use super::store::{StoreError, TokenStore};

pub const TOKEN_ENTROPY_BYTES: usize = 16;
pub const TOKEN_PLAINTEXT_LEN: usize = 26;
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

const ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("randomness source unavailable: {0}")]
    RandomnessFailure(String),
    #[error("token not found")]
    NotFound,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TokenError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

/// Freshly minted token. The plaintext exists only in this value.
#[derive(Clone)]
pub struct RegistrationToken {
    pub plaintext: String,
    pub hash: Vec<u8>,
    pub owner_id: i64,
    pub expiry: SystemTime,
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("owner_id", &self.owner_id)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl RegistrationToken {
    /// Mint a token for `owner_id` that expires `ttl` after now.
    ///
    /// # Errors
    /// Returns [`TokenError::RandomnessFailure`] if the OS RNG fails.
    pub fn generate(owner_id: i64, ttl: Duration) -> Result<Self, TokenError> {
        Self::generate_at(owner_id, ttl, SystemTime::now())
    }

    /// # Errors
    /// Returns [`TokenError::RandomnessFailure`] if the OS RNG fails.
    pub fn generate_at(owner_id: i64, ttl: Duration, now: SystemTime) -> Result<Self, TokenError> {
        Self::generate_with_rng(&mut OsRng, owner_id, ttl, now)
    }

    fn generate_with_rng<R: RngCore + ?Sized>(
        rng: &mut R,
        owner_id: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<Self, TokenError> {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|err| TokenError::RandomnessFailure(err.to_string()))?;

        let plaintext = base32::encode(ALPHABET, &bytes);
        let hash = hash_token(&plaintext);

        Ok(Self {
            plaintext,
            hash,
            owner_id,
            expiry: now + ttl,
        })
    }
}

/// Digest stored in place of the plaintext.
#[must_use]
pub fn hash_token(plaintext: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher.finalize().to_vec()
}

/// Structural check only; existence is decided by [`RegistrationTokens::resolve`].
#[must_use]
pub fn validate(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.len() == TOKEN_PLAINTEXT_LEN
}

/// Token lifecycle on top of a [`TokenStore`].
#[derive(Clone)]
pub struct RegistrationTokens {
    store: Arc<dyn TokenStore>,
    ttl: Duration,
}

impl RegistrationTokens {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Revoke every outstanding token of `owner_id` and mint a replacement.
    ///
    /// # Errors
    /// Returns an error if the RNG or the store fails; the store swap is atomic
    /// so a failure never leaves the owner with its old tokens half revoked.
    #[instrument(skip(self))]
    pub async fn issue(&self, owner_id: i64) -> Result<RegistrationToken, TokenError> {
        let token = RegistrationToken::generate(owner_id, self.ttl)?;
        self.store
            .replace_for_owner(&token.hash, owner_id, token.expiry)
            .await?;
        debug!("issued registration token");
        Ok(token)
    }

    /// # Errors
    /// [`TokenError::NotFound`] for malformed, unknown, revoked or expired tokens.
    pub async fn resolve(&self, candidate: &str) -> Result<i64, TokenError> {
        self.resolve_at(candidate, SystemTime::now()).await
    }

    /// # Errors
    /// [`TokenError::NotFound`] for malformed, unknown, revoked or expired tokens.
    pub async fn resolve_at(&self, candidate: &str, now: SystemTime) -> Result<i64, TokenError> {
        if !validate(candidate) {
            return Err(TokenError::NotFound);
        }
        let owner_id = self.store.find_by_hash(&hash_token(candidate), now).await?;
        Ok(owner_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::baduk::memory::MemoryTokenStore;
    use std::collections::HashSet;

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {}
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "entropy pool closed",
            )))
        }
    }

    fn tokens() -> RegistrationTokens {
        RegistrationTokens::new(Arc::new(MemoryTokenStore::new()), DEFAULT_TOKEN_TTL)
    }

    #[test]
    fn plaintext_is_26_base32_chars() {
        let token = RegistrationToken::generate(1, DEFAULT_TOKEN_TTL).unwrap();
        assert_eq!(token.plaintext.len(), TOKEN_PLAINTEXT_LEN);
        assert!(token
            .plaintext
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
        assert!(validate(&token.plaintext));
    }

    #[test]
    fn hash_is_sha256_of_plaintext() {
        let token = RegistrationToken::generate(1, DEFAULT_TOKEN_TTL).unwrap();
        assert_eq!(token.hash, hash_token(&token.plaintext));
        assert_eq!(token.hash.len(), 32);
        assert_ne!(token.hash, token.plaintext.as_bytes());
    }

    #[test]
    fn debug_output_omits_plaintext() {
        let token = RegistrationToken::generate(1, DEFAULT_TOKEN_TTL).unwrap();
        assert!(!format!("{token:?}").contains(&token.plaintext));
    }

    #[test]
    fn broken_rng_surfaces_randomness_failure() {
        let result =
            RegistrationToken::generate_with_rng(&mut BrokenRng, 1, DEFAULT_TOKEN_TTL, SystemTime::now());
        assert!(matches!(result, Err(TokenError::RandomnessFailure(_))));
    }

    #[test]
    fn validate_rejects_wrong_shapes() {
        assert!(!validate(""));
        assert!(!validate("ABC"));
        assert!(!validate(&"A".repeat(27)));
        assert!(validate(&"A".repeat(26)));
    }

    #[tokio::test]
    async fn concurrent_generation_is_unique() {
        let handles: Vec<_> = (0..64)
            .map(|owner| {
                tokio::spawn(async move { RegistrationToken::generate(owner, DEFAULT_TOKEN_TTL) })
            })
            .collect();

        let mut plaintexts = HashSet::new();
        let mut hashes = HashSet::new();
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            plaintexts.insert(token.plaintext);
            hashes.insert(token.hash);
        }
        assert_eq!(plaintexts.len(), 64);
        assert_eq!(hashes.len(), 64);
    }

    #[tokio::test]
    async fn token_is_valid_until_expiry() {
        let tokens = tokens();
        let token = tokens.issue(42).await.unwrap();
        let epsilon = Duration::from_millis(1);

        let before = token.expiry - epsilon;
        assert_eq!(tokens.resolve_at(&token.plaintext, before).await.unwrap(), 42);

        let after = token.expiry + epsilon;
        assert!(matches!(
            tokens.resolve_at(&token.plaintext, after).await,
            Err(TokenError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_issue_leaves_one_live_token() {
        let store = Arc::new(MemoryTokenStore::new());
        let tokens = RegistrationTokens::new(store.clone(), DEFAULT_TOKEN_TTL);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tokens = tokens.clone();
                tokio::spawn(async move { tokens.issue(7).await })
            })
            .collect();

        let mut issued = Vec::new();
        for handle in handles {
            issued.push(handle.await.unwrap().unwrap());
        }

        let mut live = 0;
        for token in &issued {
            if tokens.resolve(&token.plaintext).await.is_ok() {
                live += 1;
            }
        }
        assert_eq!(live, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn reissue_supersedes_previous_token() {
        let tokens = tokens();
        let first = tokens.issue(7).await.unwrap();
        let second = tokens.issue(7).await.unwrap();
        assert!(matches!(
            tokens.resolve(&first.plaintext).await,
            Err(TokenError::NotFound)
        ));
        assert_eq!(tokens.resolve(&second.plaintext).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn reissue_leaves_other_owners_alone() {
        let tokens = tokens();
        let mine = tokens.issue(1).await.unwrap();
        tokens.issue(2).await.unwrap();
        assert_eq!(tokens.resolve(&mine.plaintext).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_candidate_is_not_found() {
        let tokens = tokens();
        assert!(matches!(tokens.resolve("").await, Err(TokenError::NotFound)));
        assert!(matches!(
            tokens.resolve("not-a-token").await,
            Err(TokenError::NotFound)
        ));
    }
}
