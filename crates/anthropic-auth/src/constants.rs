//! Anthropic OAuth constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets; they identify the public client application and the
//! place the CLI keeps its credential record. The secrets themselves
//! (access/refresh tokens) live inside that record.

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for token refresh
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Keychain service name under which the Claude CLI stores its credential record
pub const KEYCHAIN_SERVICE: &str = "Claude Code-credentials";

/// Top-level key of the OAuth object inside the credential record
pub const OAUTH_RECORD_KEY: &str = "claudeAiOauth";

/// Field names inside the OAuth object
pub const ACCESS_TOKEN_FIELD: &str = "accessToken";
pub const REFRESH_TOKEN_FIELD: &str = "refreshToken";

/// Timeout applied to every token endpoint call
pub const REFRESH_TIMEOUT_SECS: u64 = 15;

/// Maximum number of response body characters kept in diagnostics
pub const MAX_DIAGNOSTIC_BODY_CHARS: usize = 300;
