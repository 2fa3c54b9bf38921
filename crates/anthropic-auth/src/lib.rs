//! Anthropic OAuth credential handling
//!
//! Reads the Claude CLI's stored OAuth record, refreshes expired access
//! tokens against the console token endpoint, and writes rotated tokens
//! back without disturbing the rest of the record. This crate is a
//! standalone library with no dependency on the monitor binary.
//!
//! Credential flow:
//! 1. `CredentialStore::read()` loads the record through a `SecretBackend`
//! 2. The API rejects the access token (401)
//! 3. `TokenRefresher::refresh()` exchanges the refresh token (single-flight)
//! 4. `CredentialStore::write()` merges the rotated pair into the record

pub mod constants;
pub mod credentials;
pub mod error;
pub mod file;
pub mod keychain;
pub mod token;

pub use constants::*;
pub use credentials::{
    BoxFuture, CredentialRecord, CredentialStore, MemoryBackend, SecretBackend, TokenPair,
};
pub use error::{Error, Result};
pub use file::FileBackend;
pub use keychain::{KeychainBackend, default_account};
pub use token::TokenRefresher;
