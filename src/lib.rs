//! # Baduk (account backend)
//!
//! `baduk` serves the account surface of the baduk.online site: registration,
//! email activation, cookie sessions and a coalesced health endpoint.
//!
//! ## Activation tokens
//!
//! Registration mints a single-use activation token: 16 bytes from the OS RNG,
//! base32 encoded (26 characters). Only the SHA-256 digest is stored, the
//! plaintext travels once inside the activation email. Issuing a token revokes
//! every earlier token of the same account.
//!
//! ## Sessions
//!
//! Sessions are opaque handles carried in the `baduk_session` cookie. A fresh
//! login rotates the handle; logging in again as the same account is a no-op,
//! logging in as somebody else while a session exists is refused.
//!
//! ## Throttling
//!
//! Account creation, activation and login are throttled per client address
//! with an in-memory sliding window.

pub mod baduk;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
