pub mod admin;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::AppState;

/// Build the HTTP surface: health, admin API and the published files
pub fn router(state: Arc<AppState>) -> Router {
    let files = ServeDir::new(&state.config.out_dir);

    Router::new()
        // Health endpoints
        .route("/", get(health::root))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        // Admin API
        .route("/api/status", get(admin::get_status))
        .route("/api/history", get(admin::get_history))
        .route("/api/files", get(admin::list_files))
        .route("/api/refresh", post(admin::trigger_refresh))
        .route("/api/reauth", post(admin::reauthenticate))
        // Published artifacts
        .nest_service("/files", files)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::RefreshPhase;
    use crate::services::builder::BuildOptions;
    use crate::services::history::RefreshHistory;
    use crate::services::orchestrator::{RefreshOrchestrator, RefreshSettings};
    use crate::services::output::RenderOptions;
    use crate::services::provider::fetcher::tests::{schedule_for, FakeApi};
    use crate::services::provider::{Endpoint, FetchOptions, GuideFetcher};
    use crate::services::session::tests::{manager, FakeDriver};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    async fn app_state(dir: &Path, login_delay: Duration) -> Arc<AppState> {
        let out_dir = dir.join("out");
        let config = Config {
            out_dir: out_dir.clone(),
            data_dir: dir.to_path_buf(),
            timezone: "America/New_York".to_string(),
            history_limit: 50,
            ..Config::default()
        };

        let driver = FakeDriver {
            delay: login_delay,
            ..FakeDriver::new()
        };
        let sessions = Arc::new(manager(dir, Arc::new(driver)));
        let api = Arc::new(FakeApi::new(|_, endpoint, query| match endpoint {
            Endpoint::AllChannels => Ok(json!({"channels": [
                {"ccid": "1", "channelNumber": "2", "callSign": "ABC", "channelName": "ABC East", "resourceId": "r1"}
            ]})),
            Endpoint::Playback => Ok(json!({"playbackData": {"streamURL": "https://cdn/1.m3u8"}})),
            Endpoint::Schedule => Ok(schedule_for(query)),
        }));
        let fetcher = GuideFetcher::new(
            api,
            sessions.clone(),
            FetchOptions {
                days: 1,
                window_hours: 24,
                max_channels: 10,
                min_ratio: 0.75,
                concurrency: 2,
            },
        );
        let orchestrator = RefreshOrchestrator::new(
            sessions,
            fetcher,
            RefreshHistory::load(dir.join("history.ndjson"), 50).await,
            RefreshSettings {
                out_dir,
                build: BuildOptions::default(),
                render: RenderOptions::default(),
                playback_probe: true,
                timeout: Duration::from_secs(10),
            },
        );

        Arc::new(AppState {
            config,
            orchestrator,
            start_time: Instant::now(),
        })
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let (status, body) = send(app, method, uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn wait_idle(state: &Arc<AppState>) {
        for _ in 0..300 {
            if state.orchestrator.status().await.phase == RefreshPhase::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refresh did not finish");
    }

    #[tokio::test]
    async fn test_root_and_initial_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Duration::ZERO).await;

        let (status, body) = send_json(router(state.clone()), "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, body) = send_json(router(state.clone()), "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refresh"]["phase"], "idle");
        assert_eq!(body["session"]["state"], "absent");
        assert!(body["nextScheduledRun"].is_string());

        let (status, body) = send_json(router(state), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_refresh_conflict_then_files_served() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Duration::from_millis(200)).await;

        let (status, _) = send_json(router(state.clone()), "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, body) = send_json(router(state.clone()), "POST", "/api/refresh").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());
        let (status, _) = send_json(router(state.clone()), "POST", "/api/reauth").await;
        assert_eq!(status, StatusCode::CONFLICT);

        wait_idle(&state).await;

        let (status, body) = send_json(router(state.clone()), "GET", "/api/files").await;
        assert_eq!(status, StatusCode::OK);
        let files = body["files"].as_array().unwrap();
        let names: Vec<&str> = files.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["dtv_channels.json", "dtv_channels.m3u", "dtv_epg.xml"]);
        assert_eq!(files[0]["sha1"].as_str().unwrap().len(), 40);

        let (status, body) = send(router(state.clone()), "GET", "/files/dtv_channels.m3u").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with(b"#EXTM3U\n"));

        let (status, body) = send_json(router(state.clone()), "GET", "/api/history?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"].as_array().unwrap().len(), 1);
        assert_eq!(body["records"][0]["trigger"], "manual");
        assert_eq!(body["records"][0]["outcome"], "succeeded");

        let (_, body) = send_json(router(state), "GET", "/health").await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_reauth_starts_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Duration::ZERO).await;

        let (status, body) = send_json(router(state.clone()), "POST", "/api/reauth").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["trigger"], "reauthenticate");

        wait_idle(&state).await;
        let history = state.orchestrator.history(1).await;
        assert_eq!(history[0].trigger, crate::models::TriggerSource::Reauthenticate);
    }

    #[tokio::test]
    async fn test_files_empty_before_first_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Duration::ZERO).await;
        let (status, body) = send_json(router(state), "GET", "/api/files").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"], json!([]));
    }
}
