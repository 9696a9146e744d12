//! Admin endpoints: liveness, readiness and counters

use super::AdminState;
use crate::lifecycle::LifecycleStatsSnapshot;
use crate::writer::WriteStatsSnapshot;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// GET /live
pub async fn live() -> &'static str {
    "OK"
}

/// GET /ready: the store must answer a ping.
pub async fn ready(State(state): State<AdminState>) -> (StatusCode, &'static str) {
    match crate::store::with_deadline("ping", READY_TIMEOUT, state.store.ping()).await {
        Ok(()) => (StatusCode::OK, "READY"),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub write: WriteStatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleStatsSnapshot>,
}

/// GET /stats
pub async fn stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        write: state.write.stats(),
        lifecycle: state.lifecycle.as_ref().map(|l| l.stats()),
    })
}
