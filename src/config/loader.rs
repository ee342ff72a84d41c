//! Configuration file loader with environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::AppConfig;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = ".api-cluster.toml";

/// Environment variables that override file values.
pub const ENV_CLUSTERING: &str = "CLUSTERING";
pub const ENV_PORT: &str = "PORT";
pub const ENV_NODE_ENV: &str = "NODE_ENV";
pub const ENV_MONGO_URI: &str = "MONGO_URI";
pub const ENV_WORKERS: &str = "WORKERS";
pub const ENV_ALERT_THRESHOLD: &str = "ALERT_THRESHOLD";
pub const ENV_ALERT_WEBHOOK_URL: &str = "ALERT_WEBHOOK_URL";
pub const ENV_SWAGGER_URL: &str = "SWAGGER_URL";

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
    /// The single path was given explicitly and must exist.
    required: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("api-cluster").join("config.toml"));
        }

        Self {
            search_paths,
            required: false,
        }
    }

    /// Create a config loader for an explicit config file path.
    ///
    /// Unlike the default search paths, a missing file is an error.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
            required: true,
        }
    }

    /// Load configuration using the process environment for overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, an
    /// override cannot be parsed, or the merged result is invalid.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Load configuration, resolving overrides through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigLoader::load`].
    pub fn load_with_env<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = if self.required {
            self.search_paths.first().cloned()
        } else {
            self.find_config_file()
        };

        let mut config = match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::load_from_path(&path)?
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config, lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the first config file that exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find(|p| p.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the recognized environment overrides on top of `config`.
///
/// # Errors
///
/// Returns `ConfigError::InvalidEnv` when a present variable cannot be parsed.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_CLUSTERING) {
        config.clustering = parse_bool(ENV_CLUSTERING, &value)?;
    }
    if let Some(value) = lookup(ENV_PORT) {
        config.server.port = parse_value(ENV_PORT, &value)?;
    }
    if let Some(value) = lookup(ENV_NODE_ENV) {
        config.environment = value;
    }
    if let Some(value) = lookup(ENV_MONGO_URI) {
        config.mongo_uri = value;
    }
    if let Some(value) = lookup(ENV_WORKERS) {
        config.cluster.workers = Some(parse_value(ENV_WORKERS, &value)?);
    }
    if let Some(value) = lookup(ENV_ALERT_THRESHOLD) {
        config.cluster.alert_threshold = parse_value(ENV_ALERT_THRESHOLD, &value)?;
    }
    if let Some(value) = lookup(ENV_ALERT_WEBHOOK_URL) {
        config.alert.webhook_url = Some(value).filter(|v| !v.is_empty());
    }
    if let Some(value) = lookup(ENV_SWAGGER_URL) {
        config.swagger_url = Some(value).filter(|v| !v.is_empty());
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Worker count must be at least 1, got {0}")]
    InvalidWorkerCount(usize),

    #[error("Alert threshold must be at least 1")]
    InvalidAlertThreshold,

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
