//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret is loaded from QUOTA_PILOT_CLIENT_SECRET or
//! client_secret_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudcode_auth::{CLOUDCODE_BASE_URL, DEFAULT_CLIENT_ID, TOKEN_ENDPOINT};
use quota_rotation::{DEFAULT_RETRY_BUDGET, DEFAULT_THRESHOLD, MIN_REFRESH_INTERVAL, RotationStrategy};

pub const CONFIG_ENV: &str = "QUOTA_PILOT_CONFIG";
pub const CLIENT_SECRET_ENV: &str = "QUOTA_PILOT_CLIENT_SECRET";
pub const DEFAULT_CONFIG_FILE: &str = "quota-pilot.toml";

/// Root configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub probe: ProbeConfig,
    pub rotation: RotationConfig,
    pub storage: StorageConfig,
    pub daemon: DaemonConfig,
    pub agents: AgentsConfig,
    pub logging: LoggingConfig,
}

/// Token endpoint settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub token_url: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to the env var)
    pub client_secret_file: Option<PathBuf>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            token_url: TOKEN_ENDPOINT.to_string(),
            client_secret: None,
            client_secret_file: None,
        }
    }
}

/// Quota API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_url: CLOUDCODE_BASE_URL.to_string(),
            timeout_secs: 10,
        }
    }
}

/// Model preference and account cooldown policy
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub preferred_models: Vec<String>,
    pub fallback_models: Vec<String>,
    pub threshold: f64,
    pub cooldown_secs: u64,
    pub retry_budget: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            preferred_models: Vec::new(),
            fallback_models: Vec::new(),
            threshold: DEFAULT_THRESHOLD,
            cooldown_secs: 1800,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

impl RotationConfig {
    pub fn strategy(&self) -> RotationStrategy {
        RotationStrategy {
            preferred_models: self.preferred_models.clone(),
            fallback_models: self.fallback_models.clone(),
            threshold: self.threshold,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// File locations. Unset paths resolve under the opencode config directory.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub accounts_file: Option<PathBuf>,
    pub cache_file: Option<PathBuf>,
    pub write_cache: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            accounts_file: None,
            cache_file: None,
            write_cache: true,
        }
    }
}

/// `serve` mode settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub poll_interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9464)),
            max_connections: 64,
            poll_interval_secs: MIN_REFRESH_INTERVAL.as_secs(),
            stale_after_secs: 300,
        }
    }
}

impl DaemonConfig {
    /// Poll interval, never shorter than the backend allows.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs).max(MIN_REFRESH_INTERVAL)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Multi-agent host integration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Model for agents that request none; unset means "best available"
    pub default_model: Option<String>,
}

/// Log output. Events always go to stderr; `dir` adds daily log files.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
    /// Daily files kept before the oldest is deleted
    pub retention_days: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_days: 7,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML, then resolve the client secret.
    ///
    /// Client secret resolution order:
    /// 1. QUOTA_PILOT_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;

        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("probe.base_url", &self.probe.base_url),
            ("oauth.token_url", &self.oauth.token_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("oauth.client_id must not be empty".into()));
        }

        if self.probe.timeout_secs == 0 {
            return Err(common::Error::Config(
                "probe.timeout_secs must be greater than 0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.rotation.threshold) {
            return Err(common::Error::Config(format!(
                "rotation.threshold must be within [0, 1], got: {}",
                self.rotation.threshold
            )));
        }

        if self.rotation.cooldown_secs == 0 {
            return Err(common::Error::Config(
                "rotation.cooldown_secs must be greater than 0".into(),
            ));
        }

        if self.logging.retention_days == 0 {
            return Err(common::Error::Config(
                "logging.retention_days must be greater than 0".into(),
            ));
        }

        if self.daemon.max_connections == 0 {
            return Err(common::Error::Config(
                "daemon.max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or QUOTA_PILOT_CONFIG env var.
    ///
    /// The second value is false when falling back to the default file name,
    /// which may legitimately be absent.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs)
    }
}
