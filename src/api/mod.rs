//! REST control API
//!
//! Axum routers per resource family under the `/api` prefix, plus the
//! health and metrics endpoints. Error bodies carry `{"detail": ...}` with
//! the usual REST status mapping: 400 validation/conflict, 401 auth,
//! 404 missing, 204 on delete.

mod auth_routes;
mod jobs;
mod peers;
mod services;
mod wan;

pub use auth_routes::AuthUser;

use crate::config::Settings;
use crate::deploy::DeployEngine;
use crate::dns::DnsPublisher;
use crate::error::WirewanError;
use crate::model::Store;
use crate::monitoring;
use crate::secrets::SecretEnvelope;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The overlay store
    pub store: Arc<Store>,
    /// Application settings
    pub settings: Arc<Settings>,
    /// Secret envelope for credentials
    pub envelope: Arc<SecretEnvelope>,
    /// Deployment engine
    pub engine: Arc<DeployEngine>,
    /// DNS publisher
    pub dns: Arc<DnsPublisher>,
}

/// API error with its HTTP status and `{"detail": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: serde_json::Value,
}

impl ApiError {
    /// Build an error with a plain string detail.
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: serde_json::Value::String(detail.into()),
        }
    }

    /// Build an error with a structured detail body.
    pub fn structured(status: StatusCode, detail: serde_json::Value) -> Self {
        Self { status, detail }
    }

    /// 400 with a validation message.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    /// 404 with a message.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.detail }));
        (self.status, body).into_response()
    }
}

impl From<WirewanError> for ApiError {
    fn from(err: WirewanError) -> Self {
        let status = match &err {
            WirewanError::Validation(_)
            | WirewanError::Conflict(_)
            | WirewanError::PoolExhausted(_)
            | WirewanError::InvalidState(_)
            | WirewanError::SecretUnreadable(_) => StatusCode::BAD_REQUEST,
            WirewanError::NotFound(_) => StatusCode::NOT_FOUND,
            WirewanError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WirewanError::RouterApi(_) => StatusCode::BAD_GATEWAY,
            WirewanError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = match &err {
            WirewanError::Validation(msg)
            | WirewanError::Conflict(msg)
            | WirewanError::PoolExhausted(msg)
            | WirewanError::InvalidState(msg)
            | WirewanError::SecretUnreadable(msg)
            | WirewanError::NotFound(msg)
            | WirewanError::Unauthorized(msg) => msg.clone(),
            other => other.to_string(),
        };
        ApiError::new(status, detail)
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full application router.
///
/// The `/api/wan/` and `/api/jobs/` routes are registered a second time
/// with an explicit trailing slash: axum's `nest("/x", Router::new().route("/", ...))`
/// only registers the no-trailing-slash form, and some clients request
/// the collection endpoint with a trailing slash.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/api/wan/",
            get(wan::list_wans).post(wan::create_wan),
        )
        .route("/api/jobs/", get(jobs::list_jobs))
        .nest("/api", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/auth", auth_routes::router())
        .nest("/wan", wan::router())
        .nest("/peers", peers::router())
        .nest("/services", services::router())
        .nest("/jobs", jobs::router())
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": crate::APP_NAME,
        "version": crate::VERSION,
        "api": "/api",
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        monitoring::render_metrics(&state.store),
    )
}
