//! Admin endpoints: refresh control, status, history and published files

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::sync::Arc;

use crate::models::{RefreshRecord, RefreshStatus, TriggerOutcome, TriggerSource};
use crate::services::output::publish::{BACKUP_SUFFIX, TMP_SUFFIX};
use crate::services::scheduler::next_run_after;
use crate::services::session::SessionInfo;
use crate::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn conflict() -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({ "error": "A refresh is already running" })),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub refresh: RefreshStatus,
    pub session: SessionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_run: Option<DateTime<Utc>>,
}

/// GET /api/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let refresh = state.orchestrator.status().await;
    let session = state.orchestrator.sessions().info().await;
    let next_scheduled_run = state.config.scheduler_tz().ok().map(|tz| {
        next_run_after(
            Utc::now(),
            tz,
            state.config.refresh_hour,
            state.config.refresh_minute,
        )
    });

    Json(StatusResponse {
        refresh,
        session,
        next_scheduled_run,
    })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    20
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub records: Vec<RefreshRecord>,
}

/// GET /api/history?limit=N - newest first
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.clamp(1, state.config.history_limit.max(1));
    Json(HistoryResponse {
        records: state.orchestrator.history(limit).await,
    })
}

/// POST /api/refresh - 202 when started, 409 while a refresh runs
pub async fn trigger_refresh(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.trigger(TriggerSource::Manual) {
        TriggerOutcome::Started => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "started", "trigger": "manual" })),
        )),
        TriggerOutcome::AlreadyRunning => Err(conflict()),
    }
}

/// POST /api/reauth - drop the session and refresh with a fresh login
pub async fn reauthenticate(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.orchestrator.reauthenticate().await.map_err(|e| {
        tracing::error!("Failed to invalidate session: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "Failed to invalidate session" })),
        )
    })?;

    match outcome {
        TriggerOutcome::Started => {
            tracing::info!("Session invalidated by admin request");
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "started", "trigger": "reauthenticate" })),
            ))
        }
        TriggerOutcome::AlreadyRunning => Err(conflict()),
    }
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub sha1: String,
}

#[derive(Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileEntry>,
}

/// GET /api/files - published artifacts, sorted by name
pub async fn list_files(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let files = read_artifacts(&state.config.out_dir).await.map_err(|e| {
        tracing::error!("Failed to list output directory: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "Failed to list output files" })),
        )
    })?;
    Ok(Json(FilesResponse { files }))
}

async fn read_artifacts(dir: &std::path::Path) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        // In-flight temp files and publish backups are not artifacts
        if name.ends_with(TMP_SUFFIX) || name.ends_with(BACKUP_SUFFIX) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }

        let bytes = tokio::fs::read(entry.path()).await?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);

        files.push(FileEntry {
            name,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            sha1: format!("{:x}", hasher.finalize()),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
