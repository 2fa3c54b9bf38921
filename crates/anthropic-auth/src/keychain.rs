//! OS secret store backend
//!
//! Reads the Claude CLI's generic-password item (service
//! `Claude Code-credentials`, account = login user) through the `keyring`
//! crate: Keychain on macOS, Credential Manager on Windows, the kernel
//! keyring on Linux. `keyring` is blocking, so every call runs on the
//! blocking thread pool.

use tracing::debug;

use crate::credentials::{BoxFuture, SecretBackend};
use crate::error::{Error, Result};

/// Secret backend over the platform credential store.
#[derive(Debug, Clone)]
pub struct KeychainBackend {
    service: String,
    account: String,
}

impl KeychainBackend {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn entry(&self) -> keyring::Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account)
    }
}

/// Account name the Claude CLI uses for its keychain item.
pub fn default_account() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string())
}

impl SecretBackend for KeychainBackend {
    fn id(&self) -> &str {
        "keychain"
    }

    fn load(&self) -> BoxFuture<'_, Result<Option<String>>> {
        let this = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                debug!(service = %this.service, account = %this.account, "reading keychain item");
                let entry = this.entry().map_err(map_read_error)?;
                match entry.get_password() {
                    Ok(payload) => Ok(Some(payload)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(map_read_error(e)),
                }
            })
            .await
            .map_err(|e| Error::CredentialAccessDenied(format!("keychain task failed: {e}")))?
        })
    }

    fn store(&self, payload: String) -> BoxFuture<'_, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                debug!(service = %this.service, account = %this.account, "writing keychain item");
                this.entry()
                    .and_then(|entry| entry.set_password(&payload))
                    .map_err(|e| Error::CredentialWriteFailed(describe(&e)))
            })
            .await
            .map_err(|e| Error::CredentialWriteFailed(format!("keychain task failed: {e}")))?
        })
    }
}

fn map_read_error(err: keyring::Error) -> Error {
    match err {
        keyring::Error::NoEntry => Error::CredentialNotFound,
        keyring::Error::BadEncoding(_) => {
            Error::CredentialMalformed("keychain item is not valid UTF-8".into())
        }
        other => Error::CredentialAccessDenied(describe(&other)),
    }
}

fn describe(err: &keyring::Error) -> String {
    match err {
        keyring::Error::NoStorageAccess(inner) => format!("no storage access: {inner}"),
        keyring::Error::PlatformFailure(inner) => format!("platform failure: {inner}"),
        other => other.to_string(),
    }
}
