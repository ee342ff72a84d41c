//! Configuration types.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::supervisor::AlertPolicy;

use super::ConfigError;

/// Default port for the HTTP API.
pub const DEFAULT_PORT: u16 = 3000;

/// Crash count at which the supervisor raises an alert.
pub const DEFAULT_ALERT_THRESHOLD: u64 = 5;

/// Default request body limit (50 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 50 * 1024 * 1024;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Run under the multi-process supervisor.
    pub clustering: bool,
    /// Deployment environment name ("development", "production", ...).
    pub environment: String,
    /// Document database connection string. Carried for the payload only.
    pub mongo_uri: String,
    /// Public host advertised in the API description in production.
    pub swagger_url: Option<String>,
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Supervisor settings.
    pub cluster: ClusterConfig,
    /// Crash alert delivery settings.
    pub alert: AlertConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clustering: false,
            environment: "development".to_string(),
            mongo_uri: "mongodb://localhost:27017/api".to_string(),
            swagger_url: None,
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            alert: AlertConfig::default(),
        }
    }
}

impl AppConfig {
    /// Whether the service runs in the production environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Check cross-field constraints after all sources were merged.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.workers == Some(0) {
            return Err(ConfigError::InvalidWorkerCount(0));
        }
        if self.cluster.alert_threshold == 0 {
            return Err(ConfigError::InvalidAlertThreshold);
        }
        if let Some(webhook) = &self.alert.webhook_url {
            url::Url::parse(webhook).map_err(|e| ConfigError::InvalidUrl {
                url: webhook.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port shared by every worker.
    pub port: u16,
    /// HTML page served at `/upload` for manual upload testing.
    pub upload_page: PathBuf,
    /// API description served under `/docs`.
    pub docs_path: PathBuf,
    /// Maximum accepted request body size in bytes.
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            upload_page: PathBuf::from("partials/index.html"),
            docs_path: PathBuf::from("api/swagger/swagger.yaml"),
            body_limit_bytes: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Worker count override. Unset means one worker per logical CPU.
    pub workers: Option<usize>,
    /// Crash count that triggers an alert.
    pub alert_threshold: u64,
    /// When alerts fire relative to the threshold.
    pub alert_policy: AlertPolicy,
    /// Grace period for a worker asked to stop before it is killed.
    pub shutdown_timeout_ms: u64,
    /// Delay between attempts to refill slots after a failed respawn.
    pub respawn_retry_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: None,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            alert_policy: AlertPolicy::default(),
            shutdown_timeout_ms: 5000,
            respawn_retry_ms: 1000,
        }
    }
}

impl ClusterConfig {
    /// Resolve the effective worker count.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidWorkerCount` if the count resolves to 0.
    pub fn resolve_worker_count(&self) -> Result<usize, ConfigError> {
        match self.workers {
            Some(0) => Err(ConfigError::InvalidWorkerCount(0)),
            Some(n) => Ok(n),
            None => Ok(detected_cpus()),
        }
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn respawn_retry(&self) -> Duration {
        Duration::from_millis(self.respawn_retry_ms)
    }
}

/// Number of logical CPUs, falling back to 1 when detection fails.
#[must_use]
pub fn detected_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Alert delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Endpoint receiving crash alerts as JSON. Unset logs alerts only.
    pub webhook_url: Option<String>,
    /// Who the alert is addressed to.
    pub recipient: String,
    /// Upper bound on a single alert delivery.
    pub timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            recipient: "ops@localhost".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl AlertConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
