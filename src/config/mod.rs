//! Service configuration.
//!
//! Loaded from an optional TOML file, then overridden from the environment
//! (after `.env` is read by the binaries). Validated once at startup.

use crate::oauth::{ProviderConfig, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_VAR: &str = "OAUTH_KEEPER_CONFIG";

const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

/// Upper bound for second-valued durations (one day).
const MAX_SECONDS: i64 = 24 * 60 * 60;
/// Upper bound for inactive record retention (about ten years).
const MAX_RETENTION_DAYS: i64 = 3650;

/// Complete service configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeeperConfig {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// OAuth client registration and provider endpoints
#[derive(Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Upper bound on one token endpoint round-trip
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_scopes() -> Vec<String> {
    vec![DEFAULT_SCOPE.to_string()]
}

fn default_auth_url() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_url() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            scopes: default_scopes(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            scopes: self.scopes.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

/// Credential database settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Inactive records kept by prune
    #[serde(default = "default_max_inactive_records")]
    pub max_inactive_records: usize,
    /// Inactive records older than this are purged regardless of count
    #[serde(default = "default_inactive_retention_days")]
    pub inactive_retention_days: i64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("google_oauth.db")
}

fn default_max_inactive_records() -> usize {
    10
}

fn default_inactive_retention_days() -> i64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_inactive_records: default_max_inactive_records(),
            inactive_retention_days: default_inactive_retention_days(),
        }
    }
}

/// Refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_margin_seconds")]
    pub margin_seconds: i64,
}

fn default_margin_seconds() -> i64 {
    300
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            margin_seconds: default_margin_seconds(),
        }
    }
}

/// CSRF state settings
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_ttl")]
    pub ttl_seconds: i64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_state_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:9001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Configuration errors, all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl KeeperConfig {
    /// Load from `OAUTH_KEEPER_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => load_config(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(&std::env::vars().collect())?;
        config.validate()?;
        Ok(config)
    }

    /// Override file values from environment-style variables.
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(v) = vars.get("GOOGLE_CLIENT_ID") {
            self.provider.client_id = v.trim().to_string();
        }
        if let Some(v) = vars.get("GOOGLE_CLIENT_SECRET") {
            self.provider.client_secret = v.trim().to_string();
        }
        if let Some(v) = vars.get("GOOGLE_REDIRECT_URI") {
            self.provider.redirect_uri = v.trim().to_string();
        }
        if let Some(v) = vars.get("GOOGLE_SCOPES") {
            self.provider.scopes = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = vars.get("DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = vars.get("MAX_TOKEN_RECORDS") {
            self.storage.max_inactive_records = parse_var("MAX_TOKEN_RECORDS", v)?;
        }
        if let Some(v) = vars.get("REFRESH_MARGIN_SECONDS") {
            self.refresh.margin_seconds = parse_var("REFRESH_MARGIN_SECONDS", v)?;
        }
        if let Some(v) = vars.get("OAUTH_KEEPER_BIND") {
            self.server.bind = v.clone();
        }
        Ok(())
    }

    /// Check the settings the service cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.client_id.is_empty() {
            return Err(ConfigError::Missing("GOOGLE_CLIENT_ID"));
        }
        if self.provider.client_secret.is_empty() {
            return Err(ConfigError::Missing("GOOGLE_CLIENT_SECRET"));
        }
        if self.provider.redirect_uri.is_empty() {
            return Err(ConfigError::Missing("GOOGLE_REDIRECT_URI"));
        }
        check_url("redirect_uri", &self.provider.redirect_uri)?;
        check_url("auth_url", &self.provider.auth_url)?;
        check_url("token_url", &self.provider.token_url)?;

        if self.provider.scopes.is_empty() {
            return Err(ConfigError::Invalid {
                field: "scopes",
                reason: "at least one scope is required".to_string(),
            });
        }
        check_range(
            "request_timeout_seconds",
            self.provider.request_timeout_seconds as i128,
            1,
            MAX_SECONDS,
        )?;
        check_range("margin_seconds", self.refresh.margin_seconds as i128, 0, MAX_SECONDS)?;
        check_range("ttl_seconds", self.state.ttl_seconds as i128, 1, MAX_SECONDS)?;
        check_range(
            "cleanup_interval_seconds",
            self.state.cleanup_interval_seconds as i128,
            1,
            MAX_SECONDS,
        )?;
        check_range(
            "inactive_retention_days",
            self.storage.inactive_retention_days as i128,
            1,
            MAX_RETENTION_DAYS,
        )?;
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<KeeperConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

fn parse_var<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

fn check_range(field: &'static str, value: i128, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min as i128 || value > max as i128 {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{} is outside {}..={}", value, min, max),
        });
    }
    Ok(())
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    reqwest::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid {
            field,
            reason: format!("'{}': {}", value, e),
        })
}
