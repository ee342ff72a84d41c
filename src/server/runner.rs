//! Worker runner: binds the shared port and serves until told to stop.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{bind_listener, build_router, resolve_addr, BindMode, ServerError};
use crate::config::AppConfig;
use crate::system;
use crate::worker::WORKER_ID_ENV;

/// Workload run inside each worker process.
#[async_trait]
pub trait WorkerPayload: Send + Sync {
    /// Serve on `port` until `shutdown` fires. Returns early only on a
    /// fatal error.
    async fn serve(&self, port: u16, shutdown: CancellationToken) -> Result<(), ServerError>;
}

/// The HTTP API payload.
#[derive(Debug, Clone)]
pub struct HttpPayload {
    config: AppConfig,
    bind_mode: BindMode,
}

impl HttpPayload {
    #[must_use]
    pub fn new(config: AppConfig, bind_mode: BindMode) -> Self {
        Self { config, bind_mode }
    }

    #[must_use]
    pub fn router(&self) -> Router {
        build_router(&self.config)
    }
}

#[async_trait]
impl WorkerPayload for HttpPayload {
    async fn serve(&self, port: u16, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr = resolve_addr(&self.config.server.host, port).await?;
        let listener = bind_listener(addr, self.bind_mode).await?;
        let bound = listener.local_addr().map_err(ServerError::Serve)?;

        tracing::info!(
            address = %bound,
            "Server is listening on http://{}:{}",
            system::hostname(),
            bound.port()
        );

        serve_listener(listener, self.router(), shutdown).await
    }
}

/// Serve `router` on an already bound listener with graceful shutdown.
///
/// # Errors
///
/// Returns `ServerError::Serve` if the server fails.
pub async fn serve_listener(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Server shutting down gracefully");
        })
        .await
        .map_err(ServerError::Serve)
}

/// Runs one payload on the configured port.
pub struct WorkerRunner {
    port: u16,
    payload: Arc<dyn WorkerPayload>,
}

impl WorkerRunner {
    #[must_use]
    pub fn new(port: u16, payload: Arc<dyn WorkerPayload>) -> Self {
        Self { port, payload }
    }

    /// Runner for the HTTP API described by `config`.
    ///
    /// Supervised workers pass [`BindMode::Shared`]; a standalone process
    /// owns its port exclusively.
    #[must_use]
    pub fn from_config(config: &AppConfig, bind_mode: BindMode) -> Self {
        Self::new(
            config.server.port,
            Arc::new(HttpPayload::new(config.clone(), bind_mode)),
        )
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` on a bind or serve failure. Callers must exit
    /// the process with a non-zero status so a supervisor counts a crash.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let worker_id = std::env::var(WORKER_ID_ENV).ok();
        tracing::info!(
            port = self.port,
            pid = std::process::id(),
            worker_id = ?worker_id,
            "Starting worker"
        );
        self.payload.serve(self.port, shutdown).await
    }
}
