//! Alert sinks invoked by the supervisor when the crash threshold is hit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AlertConfig;
use crate::system;

/// Connection timeout for webhook requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries for transient webhook failures.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Errors from alert delivery.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Alert transport unavailable: {0}")]
    Transport(String),
    #[error("Alert request failed: {0}")]
    RequestFailed(String),
    #[error("Alert endpoint rejected the request with HTTP {status}")]
    Rejected { status: u16 },
    #[error("Alert delivery timed out")]
    Timeout,
}

/// Capability invoked once the crash counter reaches the alert threshold.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Deliver a notification for the given crash count.
    async fn notify(&self, crash_count: u64) -> Result<(), NotificationError>;
}

/// Message delivered to an alert channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashAlert {
    pub subject: String,
    pub body: String,
    pub recipient: String,
    pub host: String,
    pub crash_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl CrashAlert {
    #[must_use]
    pub fn new(crash_count: u64, recipient: impl Into<String>) -> Self {
        let host = system::hostname();
        Self {
            subject: "API Crashed".to_string(),
            body: format!("API on {host} has crashed {crash_count} times"),
            recipient: recipient.into(),
            host,
            crash_count,
            timestamp: Utc::now(),
        }
    }
}

/// Sink that only records the alert in the log.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, crash_count: u64) -> Result<(), NotificationError> {
        tracing::error!(crash_count, "Workers crashed {crash_count} times");
        Ok(())
    }
}

/// Sink posting a JSON [`CrashAlert`] to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: Client,
    url: String,
    recipient: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl WebhookAlertSink {
    /// Create a webhook sink.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::Transport` if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        recipient: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            recipient: recipient.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(500),
        })
    }

    /// Set how many times a 5xx response is retried.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base delay between retries.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn should_retry(&self, status_code: u16, attempt: u32) -> bool {
        attempt < self.max_retries && (500..600).contains(&status_code)
    }

    /// Exponential backoff: base, 2x base, 4x base, ...
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(1 << attempt.min(16))
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, crash_count: u64) -> Result<(), NotificationError> {
        let alert = CrashAlert::new(crash_count, self.recipient.clone());

        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(&self.url)
                .json(&alert)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NotificationError::Timeout
                    } else {
                        NotificationError::RequestFailed(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let status_code = status.as_u16();
            if self.should_retry(status_code, attempt) {
                tracing::debug!(status = status_code, attempt, "Retrying crash alert");
                tokio::time::sleep(self.backoff(attempt)).await;
                attempt += 1;
                continue;
            }

            return Err(NotificationError::Rejected {
                status: status_code,
            });
        }
    }
}

/// Build the sink described by `config`.
///
/// # Errors
///
/// Returns `NotificationError::Transport` if a webhook client cannot be built.
pub fn sink_from_config(config: &AlertConfig) -> Result<Arc<dyn AlertSink>, NotificationError> {
    match &config.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Crash alerts go to webhook");
            Ok(Arc::new(WebhookAlertSink::new(
                url.clone(),
                config.recipient.clone(),
                config.timeout(),
            )?))
        }
        None => Ok(Arc::new(LogAlertSink)),
    }
}
