//! Configuration file support for mopsos-gateway.
//!
//! Loads optional TOML config from `~/.config/mopsos-gateway/config.toml`.
//! Secrets may also be supplied through the environment.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::Deserialize;

use crate::proxy::Dataset;

/// Environment variable holding the privileged application secret.
pub const ENV_PRIVILEGED_SECRET: &str = "MOPSOS_PRIVILEGED_SECRET";
/// Environment variable holding the shared user secret.
pub const ENV_USER_SECRET: &str = "MOPSOS_USER_SECRET";
/// Environment variable holding the bearer token for backing services.
pub const ENV_ACCESS_TOKEN: &str = "MOPSOS_ACCESS_TOKEN";

/// How per-user keys are verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAuthMode {
    #[default]
    Directory,
    SharedSecret,
}

/// Key directory location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// JSON file of records; when set, the remote directory is not used
    pub file: Option<PathBuf>,
    /// Firestore REST endpoint
    pub base_url: Option<String>,
    pub project: Option<String>,
    /// Firestore database id (default: "(default)")
    pub database: Option<String>,
    /// Collection holding credential documents (default: "collection api")
    pub collection: Option<String>,
    pub identity_field: Option<String>,
    pub key_field: Option<String>,
    pub expiry_field: Option<String>,
}

/// Analytical warehouse location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseConfig {
    /// BigQuery REST endpoint
    pub base_url: Option<String>,
    /// Project the query jobs run in
    pub project: Option<String>,
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Server bind address (e.g., "127.0.0.1:8000")
    pub bind: Option<String>,
    /// Allowed CORS origins (None/empty = allow any)
    pub allowed_origins: Option<Vec<String>>,
    /// Secret authorizing key lookup and preview
    pub privileged_secret: Option<String>,
    /// Per-user key verification mode (default: directory)
    pub user_auth: Option<UserAuthMode>,
    /// Secret accepted for per-user routes in shared_secret mode
    pub user_secret: Option<String>,
    /// Bearer token sent to the directory and warehouse
    pub access_token: Option<String>,
    /// Bound on a single directory read (default: 5000)
    pub lookup_timeout_ms: Option<u64>,
    /// Bound on a single warehouse read (default: 60000)
    pub read_timeout_ms: Option<u64>,
    /// Row cache TTL in seconds (default: 60, 0 disables)
    pub cache_ttl_seconds: Option<u64>,
    /// Maximum cached row sets (default: 100)
    pub cache_max_entries: Option<u64>,
    /// Age of the preview snapshot in days (default: 1)
    pub preview_days_ago: Option<u32>,
    pub directory: Option<DirectoryConfig>,
    pub warehouse: Option<WarehouseConfig>,
    /// Datasets exposed at `/<name>` (default: the five built-in datasets)
    pub datasets: Option<Vec<Dataset>>,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join("mopsos-gateway")
            .join("config.toml")
    }

    /// Load config from the default path, falling back to defaults on any error.
    pub fn load() -> Self {
        let path = Self::default_path();
        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from an explicit path. Unlike [`Config::load`], errors are fatal.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse config: {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Fill unset secrets from the environment.
    pub fn with_env_secrets(self) -> Self {
        self.with_secrets_from(|name| std::env::var(name).ok())
    }

    fn with_secrets_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fill = |slot: &mut Option<String>, name: &str| {
            if slot.is_none() {
                *slot = lookup(name).filter(|v| !v.is_empty());
            }
        };
        fill(&mut self.privileged_secret, ENV_PRIVILEGED_SECRET);
        fill(&mut self.user_secret, ENV_USER_SECRET);
        fill(&mut self.access_token, ENV_ACCESS_TOKEN);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let content = r#"
            bind = "0.0.0.0:8000"
            privileged_secret = "front"
            user_auth = "shared_secret"
            user_secret = "users"
            lookup_timeout_ms = 2500

            [directory]
            project = "tranquil-lore-396810"
            collection = "collection api"

            [warehouse]
            project = "tranquil-lore-396810"

            [[datasets]]
            name = "numerai"
            table = "p.d.numerai"
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.bind.as_deref(), Some("0.0.0.0:8000"));
        assert_eq!(config.user_auth, Some(UserAuthMode::SharedSecret));
        assert_eq!(config.lookup_timeout_ms, Some(2500));
        assert_eq!(
            config.directory.unwrap().collection.as_deref(),
            Some("collection api")
        );
        assert_eq!(config.datasets.unwrap()[0], Dataset::new("numerai", "p.d.numerai"));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.bind.is_none());
        assert!(config.datasets.is_none());
        assert_eq!(config.user_auth.unwrap_or_default(), UserAuthMode::Directory);
    }

    #[test]
    fn test_env_secrets_do_not_override_file() {
        let config = Config {
            privileged_secret: Some("from-file".into()),
            ..Config::default()
        }
        .with_secrets_from(|name| match name {
            ENV_PRIVILEGED_SECRET => Some("from-env".into()),
            ENV_USER_SECRET => Some("users".into()),
            _ => Some(String::new()),
        });
        assert_eq!(config.privileged_secret.as_deref(), Some("from-file"));
        assert_eq!(config.user_secret.as_deref(), Some("users"));
        assert_eq!(config.access_token, None);
    }

    #[test]
    fn test_load_from_missing_file_errors() {
        assert!(Config::load_from(Path::new("/nonexistent/mopsos.toml")).is_err());
    }
}
