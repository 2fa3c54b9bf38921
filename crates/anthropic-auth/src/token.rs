//! OAuth token refresh with single-flight and rotation guards
//!
//! Refresh tokens are single-use: the token endpoint invalidates the one we
//! send and hands back a new pair. Two overlapping exchanges would each
//! consume a token and leave one caller holding a pair the server already
//! rotated away, so only one refresh may be in flight per `TokenRefresher`.
//! Construct it once per process and share it.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::constants::{
    ANTHROPIC_CLIENT_ID, MAX_DIAGNOSTIC_BODY_CHARS, REFRESH_TIMEOUT_SECS, TOKEN_ENDPOINT,
};
use crate::credentials::TokenPair;
use crate::error::{Error, Result, truncate_body};

/// Response from the token endpoint.
///
/// Both tokens are optional at the serde level so a response missing one
/// of them surfaces as `TokenParsingFailed` with a precise message instead
/// of a generic deserialization error.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchanges refresh tokens for new access/refresh pairs.
pub struct TokenRefresher {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    timeout: Duration,
    in_flight: AtomicBool,
    consumed: Mutex<HashSet<[u8; 32]>>,
    exchanges: AtomicU64,
}

/// Clears the in-flight flag on every exit path, including cancellation.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TokenRefresher {
    /// Refresher against Anthropic's token endpoint.
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, TOKEN_ENDPOINT)
    }

    /// Refresher against a custom token endpoint (tests, staging).
    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            client_id: ANTHROPIC_CLIENT_ID.to_string(),
            timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
            in_flight: AtomicBool::new(false),
            consumed: Mutex::new(HashSet::new()),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether an exchange is currently running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of exchanges sent to the token endpoint (successful or not).
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Exchange `refresh` for a new token pair.
    ///
    /// Fails fast with `RefreshInProgress` if another exchange is running,
    /// and with `RefreshTokenReused` if `refresh` was already consumed by a
    /// successful exchange in this process. The caller must persist the
    /// returned pair before using it; the old refresh token is dead.
    pub async fn refresh(&self, refresh: &str) -> Result<TokenPair> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("refresh requested while another is in flight");
            return Err(Error::RefreshInProgress);
        }
        let _guard = FlightGuard(&self.in_flight);

        let fingerprint = fingerprint(refresh);
        if self.was_consumed(&fingerprint) {
            warn!("refusing to reuse a consumed refresh token");
            return Err(Error::RefreshTokenReused);
        }

        self.exchanges.fetch_add(1, Ordering::Relaxed);
        let pair = self.exchange(refresh).await?;

        self.mark_consumed(fingerprint);
        info!("token refresh succeeded");
        Ok(pair)
    }

    async fn exchange(&self, refresh: &str) -> Result<TokenPair> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading token refresh response: {e}")))?;

        if status.as_u16() != 200 {
            let body = truncate_body(&body, MAX_DIAGNOSTIC_BODY_CHARS);
            warn!(status = status.as_u16(), body = %body, "token endpoint rejected refresh");
            return Err(Error::TokenRefreshFailed {
                status: status.as_u16(),
                body,
            });
        }

        parse_token_response(&body)
    }

    fn was_consumed(&self, fingerprint: &[u8; 32]) -> bool {
        self.consumed
            .lock()
            .map(|set| set.contains(fingerprint))
            .unwrap_or(false)
    }

    fn mark_consumed(&self, fingerprint: [u8; 32]) {
        if let Ok(mut set) = self.consumed.lock() {
            set.insert(fingerprint);
        }
    }
}

/// Parse a 200 response body into a token pair.
fn parse_token_response(body: &str) -> Result<TokenPair> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| Error::TokenParsingFailed(format!("response is not valid JSON: {e}")))?;

    let access = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::TokenParsingFailed("missing access_token".into()))?;
    let refresh = parsed
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::TokenParsingFailed("missing refresh_token".into()))?;

    if let Some(expires_in) = parsed.expires_in {
        debug!(expires_in, "new access token issued");
    }
    Ok(TokenPair::new(access, refresh))
}

/// SHA-256 fingerprint so consumed tokens are not kept in memory verbatim.
fn fingerprint(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}
