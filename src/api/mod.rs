//! HTTP surfaces
//!
//! - API router (`/write`, `/read`): Prometheus remote storage protocol
//! - Admin router (`/live`, `/ready`, `/stats`): probes and counters

pub mod admin;
pub mod prompb;
pub mod remote;
mod telemetry;

use crate::lifecycle::LifecycleService;
use crate::read::ReadService;
use crate::store::StoreClient;
use crate::writer::WriteService;
use crate::{Error, ErrorKind};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tracing::warn;

/// Listener configuration for both routers
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Remote read/write port
    pub http_port: u16,
    pub admin_port: u16,
    /// Serve `/stats` on the admin router
    pub stats_enabled: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            admin_port: 9000,
            stats_enabled: true,
        }
    }
}

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub write: Arc<WriteService>,
    pub read: Arc<ReadService>,
}

/// Shared admin state
#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<dyn StoreClient>,
    pub write: Arc<WriteService>,
    /// Absent when no lifecycle task runs
    pub lifecycle: Option<LifecycleService>,
}

/// Build the remote storage router with panic recovery and compression.
pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/write", post(remote::handle_write))
        .route("/read", post(remote::handle_read))
        .with_state(state)
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
        .layer(CompressionLayer::new())
        .layer(CatchPanicLayer::new())
}

/// Build the admin router. `/stats` is only routed when enabled.
pub fn build_admin_router(state: AdminState, stats_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/live", get(admin::live))
        .route("/ready", get(admin::ready));
    if stats_enabled {
        router = router.route("/stats", get(admin::stats));
    }
    router
        .with_state(state)
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
}

/// Maps crate errors onto HTTP statuses. Prometheus retries 5xx and drops
/// the batch on 4xx.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match (&self.0, self.0.kind()) {
            (Error::ShuttingDown, _) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorKind::Request) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::Transient) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}
