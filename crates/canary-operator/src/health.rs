//! HTTP endpoints of the operator process.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::reconcile::SharedScanReport;

#[derive(Clone)]
pub struct HealthState {
    pub last_scan: SharedScanReport,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(status))
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            ),
        )
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "canary-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once a scan has listed the fleet successfully
async fn readiness_check(State(state): State<HealthState>) -> Result<Json<Value>, StatusCode> {
    match state.last_scan.read().await.as_ref() {
        Some(report) if !report.list_failed => Ok(Json(json!({
            "status": "ready",
            "service": "canary-operator",
            "lastScan": report.finished_at
        }))),
        _ => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn status(State(state): State<HealthState>) -> Result<Json<Value>, StatusCode> {
    let guard = state.last_scan.read().await;
    let report = guard.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    serde_json::to_value(report)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
