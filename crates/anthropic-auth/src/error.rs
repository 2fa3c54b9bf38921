//! Error types for credential storage and token refresh

/// Errors from credential and token operations.
///
/// Credential errors mean the user has to re-authenticate with the Claude CLI.
/// Refresh errors cover the token endpoint exchange, including the
/// single-flight collision (`RefreshInProgress`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credentials not found; run `claude auth login` first")]
    CredentialNotFound,

    #[error("credential store refused access: {0}")]
    CredentialAccessDenied(String),

    #[error("credential record is malformed: {0}")]
    CredentialMalformed(String),

    #[error("writing credentials failed: {0}")]
    CredentialWriteFailed(String),

    #[error("token refresh returned {status}: {body}")]
    TokenRefreshFailed { status: u16, body: String },

    #[error("invalid token refresh response: {0}")]
    TokenParsingFailed(String),

    #[error("a token refresh is already in progress")]
    RefreshInProgress,

    #[error("refresh token was already consumed by an earlier refresh")]
    RefreshTokenReused,

    #[error("HTTP request failed: {0}")]
    Http(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Truncate a response body for diagnostics without splitting a character.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
