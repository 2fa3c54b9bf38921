//! Minimal-cost quota probe against the messages API
//!
//! The probe sends the smallest possible completion request (one-token
//! budget, one-character prompt) purely to read the rate-limit headers off
//! the response. The body of a successful response is ignored.

use std::time::Duration;

use anthropic_auth::error::truncate_body;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::quota::{HEADER_PREFIX, QuotaInfo};

/// Messages endpoint the probe targets.
pub const MESSAGES_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Cheapest model accepted for OAuth subscription traffic.
pub const PROBE_MODEL: &str = "claude-3-haiku-20240307";

/// Anthropic API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta flag required for OAuth bearer tokens on the messages API.
pub const OAUTH_BETA_FLAG: &str = "oauth-2025-04-20";

/// Timeout applied to every probe.
pub const PROBE_TIMEOUT_SECS: u64 = 15;

const MAX_LOGGED_BODY_CHARS: usize = 300;

/// Classified probe response.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// HTTP 200 with quota headers parsed
    Success(QuotaInfo),
    /// HTTP 401; the access token needs a refresh
    Unauthorized,
    /// Any other status, with the body truncated for diagnostics
    HardError { status: u16, body: String },
}

/// Issues authenticated probe requests.
pub struct QuotaProbe {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
}

impl QuotaProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_url(client, MESSAGES_ENDPOINT)
    }

    pub fn with_url(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            model: PROBE_MODEL.to_string(),
            timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one probe with `access_token`.
    ///
    /// A 401 is an expected branch and comes back as
    /// `ProbeOutcome::Unauthorized`, never as an error. Transport failures
    /// and timeouts are `Error::Http`.
    pub async fn probe(&self, access_token: &str) -> Result<ProbeOutcome> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "." }],
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", OAUTH_BETA_FLAG)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("quota probe failed: {e}")))?;

        let status = response.status().as_u16();
        match status {
            200 => {
                for (name, value) in response.headers() {
                    if name.as_str().starts_with(HEADER_PREFIX) {
                        debug!(header = %name, value = ?value, "rate-limit header");
                    }
                }
                let quota = QuotaInfo::from_headers(response.headers());
                log_quota(&quota);
                Ok(ProbeOutcome::Success(quota))
            }
            401 => {
                debug!("probe rejected access token");
                Ok(ProbeOutcome::Unauthorized)
            }
            _ => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| Error::InvalidResponse(format!("reading error body: {e}")))?;
                let body = truncate_body(&text, MAX_LOGGED_BODY_CHARS);
                warn!(status, body = %body, "quota probe returned an error status");
                Ok(ProbeOutcome::HardError { status, body })
            }
        }
    }
}

fn log_quota(quota: &QuotaInfo) {
    let reset = quota
        .reset_at
        .map(|r| r.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "?".to_string());
    info!(
        utilization_5h_pct = %format!("{:.1}", quota.utilization_5h * 100.0),
        utilization_7d_pct = %format!("{:.1}", quota.utilization_7d * 100.0),
        reset = %reset,
        status = quota.status.as_deref().unwrap_or("?"),
        "quota probed"
    );
}
