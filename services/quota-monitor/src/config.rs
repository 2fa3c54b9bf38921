//! Configuration types and loading
//!
//! Config precedence: `--config` CLI arg > `CONFIG_PATH` env var > default
//! file name. Every section is optional; a missing default file means
//! built-in defaults, while a missing explicit file is an error.

use anthropic_auth::{KEYCHAIN_SERVICE, TOKEN_ENDPOINT};
use anthropic_quota::probe::{MESSAGES_ENDPOINT, PROBE_MODEL, PROBE_TIMEOUT_SECS};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_PATH: &str = "claude-quota-monitor.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub poll: PollConfig,
    pub credentials: CredentialsConfig,
    pub api: ApiConfig,
    pub status: StatusConfig,
}

/// Poll cadence
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub normal_interval_secs: u64,
    pub elevated_interval_secs: u64,
    /// 5h utilization at or above which the elevated interval applies
    pub elevated_threshold: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            normal_interval_secs: 120,
            elevated_interval_secs: 30,
            elevated_threshold: 0.75,
        }
    }
}

/// Where the Claude CLI keeps its OAuth record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Keychain,
    File,
}

impl Default for BackendKind {
    /// Linux installs of the Claude CLI keep credentials in a JSON file;
    /// macOS and Windows use the platform keychain.
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            BackendKind::File
        } else {
            BackendKind::Keychain
        }
    }
}

/// Credential store settings
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    pub backend: BackendKind,
    /// Keychain service name
    pub service: String,
    /// Keychain account, defaults to the current user
    pub account: Option<String>,
    /// File backend path, defaults to `~/.claude/.credentials.json`
    pub path: Option<PathBuf>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            service: KEYCHAIN_SERVICE.to_string(),
            account: None,
            path: None,
        }
    }
}

impl CredentialsConfig {
    pub fn account(&self) -> String {
        self.account
            .clone()
            .unwrap_or_else(anthropic_auth::default_account)
    }

    /// Resolve the credentials file, falling back to the Claude CLI's
    /// location under the home directory.
    pub fn file_path(&self) -> common::Result<PathBuf> {
        if let Some(ref path) = self.path {
            return Ok(path.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".claude").join(".credentials.json"))
            .ok_or_else(|| {
                common::Error::Config(
                    "credentials.path is not set and the home directory is unknown".into(),
                )
            })
    }
}

/// Anthropic endpoints and probe settings
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub messages_url: String,
    pub token_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            messages_url: MESSAGES_ENDPOINT.to_string(),
            token_url: TOKEN_ENDPOINT.to_string(),
            model: PROBE_MODEL.to_string(),
            timeout_secs: PROBE_TIMEOUT_SECS,
        }
    }
}

/// Optional HTTP status endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    pub listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Like `load`, but a missing file at the default path yields defaults.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.poll.normal_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll.normal_interval_secs must be greater than 0".into(),
            ));
        }
        if self.poll.elevated_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll.elevated_interval_secs must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.poll.elevated_threshold) {
            return Err(common::Error::Config(format!(
                "poll.elevated_threshold must be within [0, 1], got: {}",
                self.poll.elevated_threshold
            )));
        }
        for (key, url) in [
            ("api.messages_url", &self.api.messages_url),
            ("api.token_url", &self.api.token_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{key} must start with http:// or https://, got: {url}"
                )));
            }
        }
        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "api.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.api.model.trim().is_empty() {
            return Err(common::Error::Config("api.model must not be empty".into()));
        }
        if self.credentials.service.trim().is_empty() {
            return Err(common::Error::Config(
                "credentials.service must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn normal_interval(&self) -> Duration {
        Duration::from_secs(self.poll.normal_interval_secs)
    }

    pub fn elevated_interval(&self) -> Duration {
        Duration::from_secs(self.poll.elevated_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}
