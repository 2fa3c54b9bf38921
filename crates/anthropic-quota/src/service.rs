//! Quota fetching with one refresh-and-retry
//!
//! `QuotaService` ties the credential store, the token refresher and the
//! probe into a single `fetch_quota()`:
//!
//! 1. Read the token pair from the credential store
//! 2. Probe with the access token
//! 3. On 401: refresh (single-flight), persist the rotated pair, probe once more
//! 4. Still 401 after that: `StillUnauthorized`, no further attempts
//!
//! One call therefore makes at most one refresh and at most two probes.

use anthropic_auth::{BoxFuture, CredentialStore, TokenRefresher};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::probe::{ProbeOutcome, QuotaProbe};
use crate::quota::QuotaInfo;

/// Anything that can produce a fresh quota snapshot.
///
/// The poll scheduler depends on this seam rather than on `QuotaService`
/// directly. Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility.
pub trait QuotaSource: Send + Sync {
    fn fetch_quota(&self) -> BoxFuture<'_, Result<QuotaInfo>>;
}

/// Orchestrates credential read, probe, refresh, and retry.
///
/// Construct once at startup and share via `Arc`; the refresher's
/// single-flight guard only holds process-wide if there is one instance.
pub struct QuotaService {
    store: CredentialStore,
    refresher: TokenRefresher,
    probe: QuotaProbe,
}

impl QuotaService {
    pub fn new(store: CredentialStore, refresher: TokenRefresher, probe: QuotaProbe) -> Self {
        Self {
            store,
            refresher,
            probe,
        }
    }

    pub fn credential_store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    /// Fetch the current quota snapshot.
    pub async fn fetch_quota(&self) -> Result<QuotaInfo> {
        let tokens = self.store.tokens().await?;

        match self.probe.probe(tokens.access.expose()).await? {
            ProbeOutcome::Success(quota) => return Ok(quota),
            ProbeOutcome::HardError { status, body } => {
                return Err(Error::ApiError { status, body });
            }
            ProbeOutcome::Unauthorized => {
                info!("access token rejected, refreshing");
            }
        }

        let rotated = match self.refresher.refresh(tokens.refresh.expose()).await {
            Ok(pair) => {
                metrics::counter!("quota_token_refreshes_total", "outcome" => "success")
                    .increment(1);
                pair
            }
            Err(e) => {
                let outcome = match e {
                    anthropic_auth::Error::RefreshInProgress => "in_progress",
                    _ => "error",
                };
                metrics::counter!("quota_token_refreshes_total", "outcome" => outcome)
                    .increment(1);
                warn!(error = %e, "token refresh failed");
                return Err(e.into());
            }
        };

        // The old refresh token is already dead server-side; losing this
        // write means the user has to log in again.
        if let Err(e) = self
            .store
            .write(rotated.access.expose(), rotated.refresh.expose())
            .await
        {
            error!(
                backend = self.store.backend_id(),
                error = %e,
                "failed to persist rotated tokens"
            );
            return Err(e.into());
        }

        match self.probe.probe(rotated.access.expose()).await? {
            ProbeOutcome::Success(quota) => Ok(quota),
            ProbeOutcome::Unauthorized => {
                warn!("refreshed access token still rejected");
                Err(Error::StillUnauthorized)
            }
            ProbeOutcome::HardError { status, body } => Err(Error::ApiError { status, body }),
        }
    }
}

impl QuotaSource for QuotaService {
    fn fetch_quota(&self) -> BoxFuture<'_, Result<QuotaInfo>> {
        Box::pin(QuotaService::fetch_quota(self))
    }
}
