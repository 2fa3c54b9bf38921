//! Error types for quota fetching

/// Errors from `QuotaService::fetch_quota`.
///
/// Credential and refresh failures arrive unmodified inside `Auth`; the
/// variants here cover what happens at the probe itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] anthropic_auth::Error),

    #[error("access token still rejected after refresh; run `claude auth login`")]
    StillUnauthorized,

    #[error("invalid API response: {0}")]
    InvalidResponse(String),

    #[error("{}", api_error_message(.status))]
    ApiError { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(String),
}

fn api_error_message(status: &u16) -> String {
    if *status == 429 {
        "API rate limit reached (HTTP 429); retrying on the next poll".to_string()
    } else {
        format!("API error (HTTP {status})")
    }
}

impl Error {
    /// Whether the user has to log in again with the Claude CLI to recover.
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self,
            Error::StillUnauthorized
                | Error::Auth(
                    anthropic_auth::Error::CredentialNotFound
                        | anthropic_auth::Error::CredentialMalformed(_)
                        | anthropic_auth::Error::TokenRefreshFailed { .. }
                )
        )
    }
}

/// Result alias for quota operations.
pub type Result<T> = std::result::Result<T, Error>;
