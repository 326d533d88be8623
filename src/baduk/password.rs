//! Argon2id password hashes in PHC string format.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash `plaintext` with a fresh random salt.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(plaintext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// `Ok(false)` on mismatch; `Err` only when the stored hash is unusable.
///
/// # Errors
/// Returns an error if `stored_hash` is not a valid PHC string.
pub fn verify_password(plaintext: &str, stored_hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(stored_hash).map_err(|err| anyhow!("invalid password hash: {err}"))?;
    match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(anyhow!("failed to verify password: {err}")),
    }
}

/// Same as [`hash_password`], off the async runtime.
///
/// # Errors
/// Returns an error if hashing fails or the blocking task panics.
pub async fn hash_password_blocking(plaintext: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&plaintext)).await?
}

/// Same as [`verify_password`], off the async runtime.
///
/// # Errors
/// Returns an error if the hash is unusable or the blocking task panics.
pub async fn verify_password_blocking(plaintext: String, stored_hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || verify_password(&plaintext, &stored_hash)).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trips() -> Result<()> {
        let hash = hash_password("pa55word")?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("pa55word", &hash)?);
        assert!(!verify_password("wrong-password", &hash)?);
        Ok(())
    }

    #[test]
    fn salts_differ() -> Result<()> {
        assert_ne!(hash_password("pa55word")?, hash_password("pa55word")?);
        Ok(())
    }

    #[test]
    fn garbage_hash_is_an_error() {
        assert!(verify_password("pa55word", "not-a-phc-string").is_err());
    }

    #[tokio::test]
    async fn blocking_variants_match() -> Result<()> {
        let hash = hash_password_blocking("pa55word".to_string()).await?;
        assert!(verify_password_blocking("pa55word".to_string(), hash).await?);
        Ok(())
    }
}
