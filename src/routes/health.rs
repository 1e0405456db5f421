use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

use crate::models::RefreshPhase;
use crate::services::session::SessionState;
use crate::AppState;

/// Root endpoint - basic status
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "DTV Guide Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "files": "/files/",
        "api": ["/api/status", "/api/history", "/api/files", "/api/refresh", "/api/reauth"]
    }))
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    uptime: u64,
    session: SessionState,
    refresh: RefreshPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_success_age_secs: Option<i64>,
}

/// GET /health
///
/// "ok" when the last successful refresh is under two days old, "degraded"
/// when there has been none or it is older.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    let status = state.orchestrator.status().await;
    let session = state.orchestrator.sessions().info().await;

    let last_success_age_secs = status
        .last_success
        .as_ref()
        .map(|r| (Utc::now() - r.finished_at).num_seconds());

    let healthy = matches!(last_success_age_secs, Some(age) if age < 2 * 24 * 3600);

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        uptime,
        session: session.state,
        refresh: status.phase,
        last_success_age_secs,
    })
}

/// GET /metrics - Prometheus metrics
pub async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                b"Internal Server Error".to_vec(),
            )
        }
    }
}
