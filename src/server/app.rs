//! HTTP application served by each worker.

use std::any::Any;
use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, OriginalUri, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::system;
use crate::worker::WORKER_ID_ENV;

/// JSON envelope used by every API response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    pub msg: String,
    pub data: serde_json::Value,
}

impl ApiResponse {
    #[must_use]
    pub fn ok(msg: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            data,
        }
    }

    #[must_use]
    pub fn error(msg: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            msg: msg.into(),
            data,
        }
    }
}

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub environment: String,
    /// Supervisor-assigned id when running as a worker.
    pub worker_id: Option<String>,
    pub docs_path: PathBuf,
    /// Host advertised in the served API description.
    pub docs_host: String,
}

impl AppState {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let docs_host = match (&config.swagger_url, config.is_production()) {
            (Some(url), true) => url.clone(),
            _ => format!("{}:{}", system::hostname(), config.server.port),
        };

        Self {
            environment: config.environment.clone(),
            worker_id: std::env::var(WORKER_ID_ENV).ok(),
            docs_path: config.server.docs_path.clone(),
            docs_host,
        }
    }
}

/// Build the router with all routes and middleware.
pub fn build_router(config: &AppConfig) -> Router {
    let state = AppState::from_config(config);
    let production = config.is_production();

    Router::new()
        .route("/health", get(get_health))
        .route("/api/status", get(get_status))
        .route("/docs/swagger.yaml", get(get_docs))
        .route_service("/upload", ServeFile::new(&config.server.upload_page))
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.body_limit_bytes))
        .layer(CompressionLayer::new())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_DNS_PREFETCH_CONTROL,
            HeaderValue::from_static("off"),
        ))
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| internal_error(&*panic, production),
        ))
        .layer(TraceLayer::new_for_http())
}

/// GET /health - Liveness check.
pub async fn get_health() -> Json<ApiResponse> {
    Json(ApiResponse::ok("OK", serde_json::json!({})))
}

/// GET /api/status - Identify the worker answering the request.
pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse> {
    Json(ApiResponse::ok(
        "Status",
        serde_json::json!({
            "environment": state.environment,
            "worker_id": state.worker_id,
            "pid": std::process::id(),
            "host": system::hostname(),
        }),
    ))
}

/// GET /docs/swagger.yaml - API description with the advertised host filled in.
pub async fn get_docs(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.docs_path).await {
        Ok(doc) => (
            [(header::CONTENT_TYPE, "application/yaml")],
            with_host(&doc, &state.docs_host),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(path = %state.docs_path.display(), error = %e, "API description unavailable");
            (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(
                    "API documentation not found",
                    serde_json::json!({}),
                )),
            )
                .into_response()
        }
    }
}

/// Fallback for unknown routes.
pub async fn not_found(OriginalUri(uri): OriginalUri) -> (StatusCode, Json<ApiResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(
            "API not found",
            serde_json::Value::String(format!("{uri} not found")),
        )),
    )
}

fn internal_error(panic: &(dyn Any + Send), production: bool) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(detail = %detail, "Handler panicked");

    let data = if production {
        serde_json::json!({})
    } else {
        serde_json::Value::String(detail)
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error("Internal Server Error", data)),
    )
        .into_response()
}

/// Set the top-level `host:` entry of a YAML API description.
fn with_host(doc: &str, host: &str) -> String {
    let mut replaced = false;
    let mut lines: Vec<String> = doc
        .lines()
        .map(|line| {
            if !replaced && line.starts_with("host:") {
                replaced = true;
                format!("host: {host}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("host: {host}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
