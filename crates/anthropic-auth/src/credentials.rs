//! Credential record storage for OAuth tokens
//!
//! The Claude CLI keeps a single JSON record in an OS-provided secret store
//! (macOS Keychain, Windows Credential Manager, Linux keyring) or, on hosts
//! without one, in `~/.claude/.credentials.json`. The record looks like:
//!
//! ```json
//! { "claudeAiOauth": { "accessToken": "...", "refreshToken": "...", "expiresAt": 0 }, "other": {} }
//! ```
//!
//! `CredentialStore` parses that record and writes rotated tokens back with
//! read-merge-write semantics: only the two token fields change, every other
//! key (top level or inside `claudeAiOauth`) survives verbatim. Where the
//! bytes live is decided by a `SecretBackend`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::Secret;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{ACCESS_TOKEN_FIELD, OAUTH_RECORD_KEY, REFRESH_TOKEN_FIELD};
use crate::error::{Error, Result};

/// Boxed future returned by dyn-compatible async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw access to wherever the credential payload is persisted.
///
/// Backends move opaque strings; parsing and merging happen in
/// `CredentialStore` so every backend gets identical record semantics.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn SecretBackend>`).
pub trait SecretBackend: Send + Sync {
    /// Identifier for logging (e.g. "keychain", "file", "memory")
    fn id(&self) -> &str;

    /// Load the stored payload. `Ok(None)` means no record exists.
    ///
    /// Fails with `CredentialAccessDenied` when the store refuses access.
    fn load(&self) -> BoxFuture<'_, Result<Option<String>>>;

    /// Create or replace the stored payload.
    ///
    /// Fails with `CredentialWriteFailed` on any store-layer error.
    fn store(&self, payload: String) -> BoxFuture<'_, Result<()>>;
}

/// An access/refresh token pair. Both values are redacted in logs.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
        }
    }
}

/// The stored credential record: an opaque JSON object whose
/// `claudeAiOauth.accessToken` / `claudeAiOauth.refreshToken` fields we own.
#[derive(Clone, Default)]
pub struct CredentialRecord {
    fields: Map<String, Value>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("keys", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialRecord {
    /// Parse a stored payload. The payload must be a JSON object; token
    /// presence is checked separately by [`CredentialRecord::tokens`].
    pub fn parse(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| Error::CredentialMalformed(format!("payload is not JSON: {e}")))?;
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(Error::CredentialMalformed(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// Extract the token pair, failing with `CredentialMalformed` when the
    /// OAuth object or either token is missing.
    pub fn tokens(&self) -> Result<TokenPair> {
        let oauth = self
            .fields
            .get(OAUTH_RECORD_KEY)
            .and_then(Value::as_object)
            .ok_or_else(|| Error::CredentialMalformed(format!("missing `{OAUTH_RECORD_KEY}` object")))?;
        let access = string_field(oauth, ACCESS_TOKEN_FIELD)?;
        let refresh = string_field(oauth, REFRESH_TOKEN_FIELD)?;
        Ok(TokenPair::new(access, refresh))
    }

    /// Overwrite only the two token fields, keeping all siblings.
    pub fn set_tokens(&mut self, access: &str, refresh: &str) -> Result<()> {
        let oauth = self
            .fields
            .entry(OAUTH_RECORD_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        let oauth = oauth.as_object_mut().ok_or_else(|| {
            Error::CredentialMalformed(format!("`{OAUTH_RECORD_KEY}` is not an object"))
        })?;
        oauth.insert(ACCESS_TOKEN_FIELD.into(), Value::String(access.into()));
        oauth.insert(REFRESH_TOKEN_FIELD.into(), Value::String(refresh.into()));
        Ok(())
    }

    /// Serialize back to the compact JSON the Claude CLI writes.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(&self.fields)
            .map_err(|e| Error::CredentialWriteFailed(format!("serializing record: {e}")))
    }
}

fn string_field(oauth: &Map<String, Value>, key: &str) -> Result<String> {
    match oauth.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(Error::CredentialMalformed(format!("`{key}` is empty"))),
        Some(other) => Err(Error::CredentialMalformed(format!(
            "`{key}` must be a string, found {}",
            json_kind(other)
        ))),
        None => Err(Error::CredentialMalformed(format!("missing `{key}`"))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads and writes the credential record through a `SecretBackend`.
///
/// The Mutex serializes read-merge-write cycles so two writers in the same
/// process cannot interleave and drop each other's fields.
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        info!(backend = backend.id(), "credential store initialized");
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Backend identifier for logging and status output.
    pub fn backend_id(&self) -> &str {
        self.backend.id()
    }

    /// Read and validate the stored record.
    ///
    /// Fails with `CredentialNotFound` when nothing is stored,
    /// `CredentialAccessDenied` when the store refuses access, and
    /// `CredentialMalformed` when the payload is not the expected structure.
    pub async fn read(&self) -> Result<CredentialRecord> {
        let payload = self.backend.load().await?.ok_or(Error::CredentialNotFound)?;
        let record = CredentialRecord::parse(&payload)?;
        record.tokens()?;
        Ok(record)
    }

    /// Read the current token pair.
    pub async fn tokens(&self) -> Result<TokenPair> {
        self.read().await?.tokens()
    }

    /// Persist a rotated token pair with read-merge-write.
    ///
    /// A missing record is created from an empty object. An existing record
    /// that cannot be parsed is left untouched and reported as malformed.
    /// Any other failure to read or store fails with `CredentialWriteFailed`.
    pub async fn write(&self, access: &str, refresh: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let existing = match self.backend.load().await {
            Ok(existing) => existing,
            Err(e @ Error::CredentialMalformed(_)) => return Err(e),
            Err(e) => {
                return Err(Error::CredentialWriteFailed(format!(
                    "reading existing record: {e}"
                )));
            }
        };
        let mut record = match existing {
            Some(payload) => CredentialRecord::parse(&payload)?,
            None => {
                debug!(backend = self.backend.id(), "no existing record, creating one");
                CredentialRecord::default()
            }
        };
        record.set_tokens(access, refresh)?;
        self.backend.store(record.to_payload()?).await?;

        debug!(backend = self.backend.id(), "persisted rotated tokens");
        Ok(())
    }
}

/// In-process backend holding the payload in memory.
///
/// Counts successful writes so callers can assert on persistence. Can be
/// built in a "denied" mode that refuses every access.
#[derive(Default)]
pub struct MemoryBackend {
    payload: Mutex<Option<String>>,
    writes: AtomicUsize,
    denied: bool,
}

impl MemoryBackend {
    /// Empty backend (no record stored).
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with a raw payload.
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Mutex::new(Some(payload.into())),
            ..Self::default()
        }
    }

    /// Backend pre-populated with a minimal record holding the given tokens.
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        Self::with_payload(
            serde_json::json!({
                OAUTH_RECORD_KEY: {
                    ACCESS_TOKEN_FIELD: access,
                    REFRESH_TOKEN_FIELD: refresh,
                }
            })
            .to_string(),
        )
    }

    /// Backend that refuses all access, like a locked keychain.
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    /// Current raw payload.
    pub async fn payload(&self) -> Option<String> {
        self.payload.lock().await.clone()
    }

    /// Number of successful `store` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SecretBackend for MemoryBackend {
    fn id(&self) -> &str {
        "memory"
    }

    fn load(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            if self.denied {
                return Err(Error::CredentialAccessDenied("memory backend is locked".into()));
            }
            Ok(self.payload.lock().await.clone())
        })
    }

    fn store(&self, payload: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.denied {
                return Err(Error::CredentialWriteFailed("memory backend is locked".into()));
            }
            *self.payload.lock().await = Some(payload);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
